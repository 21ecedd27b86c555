//! The extraction instruction sent with every page image.
//!
//! The instruction is the same for every page of every document: it describes
//! the reply schema, and the page image carries all page-specific content.
//! Keep it in sync with [`crate::pipeline::extract::validate_components`].

/// Schema-describing instruction for component extraction.
pub const EXTRACTION_INSTRUCTION: &str = r#"You are a document OCR and layout system. The attached image is one page of a document rendered at a fixed resolution.

Extract ALL visible content from the page as a list of components.

Identify:
1. Text blocks (paragraphs, lists, form fields, captions)
2. Tables, with their structure preserved
3. Images, figures, logos and charts
4. Page headers and page footers

For each component return:
- component_id: a string unique on this page, numbered in reading order ("0", "1", "2", …)
- type: exactly one of "text", "table", "image", "header", "footer"
- content: the extracted text. For tables use Markdown table syntax. For images give a short description, or "" if there is nothing to say.
- confidence: a number between 0 and 1 expressing how sure you are of the extraction
- bbox: [left, top, right, bottom] in pixels of the attached image, with left < right and top < bottom

Return ONLY a JSON object of this exact shape, with no commentary and no code fences:
{"components": [{"component_id": "0", "type": "text", "content": "…", "confidence": 0.95, "bbox": [100, 100, 800, 200]}]}

If the page is blank, return {"components": []}."#;

/// The instruction to use: a caller override or the built-in default.
pub fn instruction(custom: Option<&str>) -> &str {
    match custom {
        Some(text) if !text.trim().is_empty() => text,
        _ => EXTRACTION_INSTRUCTION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ComponentType;

    #[test]
    fn instruction_names_every_component_type() {
        for kind in ComponentType::ALL {
            assert!(
                EXTRACTION_INSTRUCTION.contains(&format!("\"{kind}\"")),
                "instruction does not mention {kind}"
            );
        }
    }

    #[test]
    fn blank_override_falls_back_to_default() {
        assert_eq!(instruction(None), EXTRACTION_INSTRUCTION);
        assert_eq!(instruction(Some("   ")), EXTRACTION_INSTRUCTION);
        assert_eq!(instruction(Some("custom")), "custom");
    }
}
