//! PDF rasterisation: render one page at a time into a scratch PNG.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which uses thread-local
//! state and is not safe to call from async contexts. Every render runs on
//! Tokio's blocking pool so worker threads keep serving network I/O.
//!
//! ## Why one page at a time?
//!
//! [`PageSequence`] renders page *n* only when it is asked for. With at most
//! `concurrency` pages in flight, a 500-page document never holds more than
//! `concurrency` rasters in memory or on disk.

use crate::error::PdfScanError;
use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// PDF user space is 72 points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Synchronous page renderer. Implementations are called from the blocking pool.
pub trait Rasterizer: Send + Sync {
    /// Number of pages, or [`PdfScanError::SourceUnreadable`].
    fn page_count(&self, path: &Path) -> Result<usize, PdfScanError>;

    /// Render the page at 0-based `index` at `dpi`.
    ///
    /// Fails with [`PdfScanError::InvalidPageIndex`] when `index` is out of range.
    fn render_page(&self, path: &Path, index: usize, dpi: u32) -> Result<DynamicImage, PdfScanError>;
}

/// [`Rasterizer`] backed by pdfium.
///
/// The library is looked up in `PDFIUM_LIB_PATH`, then next to the working
/// directory, then on the system library path.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    password: Option<String>,
}

impl PdfiumRasterizer {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    fn bind(&self) -> Result<Pdfium, PdfScanError> {
        let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
            Some(path) => Pdfium::bind_to_library(PathBuf::from(path)),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| {
            PdfScanError::Internal(format!(
                "Failed to bind to pdfium library: {e:?}. Set PDFIUM_LIB_PATH=/path/to/libpdfium"
            ))
        })?;
        Ok(Pdfium::new(bindings))
    }

    fn open<'a>(&'a self, pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, PdfScanError> {
        pdfium
            .load_pdf_from_file(path, self.password.as_deref())
            .map_err(|e| {
                let err_str = format!("{e:?}");
                let detail = if err_str.to_lowercase().contains("password") {
                    if self.password.is_some() {
                        "wrong password".to_string()
                    } else {
                        "document is encrypted and requires a password".to_string()
                    }
                } else {
                    err_str
                };
                PdfScanError::SourceUnreadable {
                    path: path.to_path_buf(),
                    detail,
                }
            })
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn page_count(&self, path: &Path) -> Result<usize, PdfScanError> {
        let pdfium = self.bind()?;
        let document = self.open(&pdfium, path)?;
        Ok(document.pages().len() as usize)
    }

    fn render_page(&self, path: &Path, index: usize, dpi: u32) -> Result<DynamicImage, PdfScanError> {
        let pdfium = self.bind()?;
        let document = self.open(&pdfium, path)?;
        let pages = document.pages();
        let total = pages.len() as usize;
        if index >= total {
            return Err(PdfScanError::InvalidPageIndex { index, total });
        }

        let page = pages
            .get(index as u16)
            .map_err(|e| PdfScanError::RasterisationFailed {
                page: index + 1,
                detail: format!("{e:?}"),
            })?;

        let render_config =
            PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / POINTS_PER_INCH);
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            PdfScanError::RasterisationFailed {
                page: index + 1,
                detail: format!("{e:?}"),
            }
        })?;

        Ok(bitmap.as_image())
    }
}

/// A rendered page living in the scratch area.
///
/// The PNG is deleted when the value is dropped, so the file cannot outlive
/// the task that owns it on any exit path.
#[derive(Debug)]
pub struct PageImage {
    /// 1-based.
    pub page_number: usize,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    file: NamedTempFile,
}

impl PageImage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Delete the scratch file now, reporting any I/O error.
    pub fn release(self) -> std::io::Result<()> {
        self.file.close()
    }
}

/// Write `image` as a PNG into `scratch_dir` and hand ownership to the caller.
pub fn write_scratch_png(
    image: &DynamicImage,
    page_number: usize,
    dpi: u32,
    scratch_dir: &Path,
) -> Result<PageImage, PdfScanError> {
    let render_err = |detail: String| PdfScanError::RasterisationFailed {
        page: page_number,
        detail,
    };

    let prefix = format!("page_{page_number:04}_");
    let mut file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".png")
        .tempfile_in(scratch_dir)
        .map_err(|e| render_err(format!("scratch file: {e}")))?;

    {
        let mut writer = BufWriter::new(file.as_file_mut());
        image
            .write_to(&mut writer, ImageFormat::Png)
            .map_err(|e| render_err(format!("PNG encoding: {e}")))?;
        writer
            .flush()
            .map_err(|e| render_err(format!("scratch write: {e}")))?;
    }

    debug!(
        "Rendered page {} → {}x{} px at {} dpi",
        page_number,
        image.width(),
        image.height(),
        dpi
    );

    Ok(PageImage {
        page_number,
        width: image.width(),
        height: image.height(),
        dpi,
        file,
    })
}

/// Render one page on the blocking pool and store it in `scratch_dir`.
pub async fn render_to_scratch(
    rasterizer: Arc<dyn Rasterizer>,
    source: &Path,
    index: usize,
    dpi: u32,
    scratch_dir: &Path,
) -> Result<PageImage, PdfScanError> {
    let source = source.to_path_buf();
    let scratch = scratch_dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let image = rasterizer.render_page(&source, index, dpi)?;
        write_scratch_png(&image, index + 1, dpi, &scratch)
    })
    .await
    .map_err(|e| PdfScanError::Internal(format!("Render task panicked: {e}")))?
}

/// Lazy, restartable sequence of page images for one document.
///
/// Opening only counts pages; rendering happens per request. Pages can be
/// pulled in order with [`PageSequence::next_page`] or fetched directly with
/// [`PageSequence::page`], which is what the orchestrator does from
/// concurrent workers.
pub struct PageSequence {
    rasterizer: Arc<dyn Rasterizer>,
    source: PathBuf,
    scratch_dir: PathBuf,
    dpi: u32,
    total: usize,
    cursor: usize,
}

impl PageSequence {
    /// Open `source` and count its pages.
    pub async fn open(
        rasterizer: Arc<dyn Rasterizer>,
        source: &Path,
        scratch_dir: &Path,
        dpi: u32,
    ) -> Result<Self, PdfScanError> {
        let path = source.to_path_buf();
        let counter = Arc::clone(&rasterizer);
        let total = tokio::task::spawn_blocking(move || counter.page_count(&path))
            .await
            .map_err(|e| PdfScanError::Internal(format!("Page count task panicked: {e}")))??;

        info!("Document opened: {} pages", total);

        Ok(Self {
            rasterizer,
            source: source.to_path_buf(),
            scratch_dir: scratch_dir.to_path_buf(),
            dpi,
            total,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Render page `page_number` (1-based).
    pub async fn page(&self, page_number: usize) -> Result<PageImage, PdfScanError> {
        if page_number == 0 || page_number > self.total {
            return Err(PdfScanError::InvalidPageIndex {
                index: page_number.wrapping_sub(1),
                total: self.total,
            });
        }
        render_to_scratch(
            Arc::clone(&self.rasterizer),
            &self.source,
            page_number - 1,
            self.dpi,
            &self.scratch_dir,
        )
        .await
    }

    /// Render the next page in order, or `None` at the end.
    pub async fn next_page(&mut self) -> Option<Result<PageImage, PdfScanError>> {
        if self.cursor >= self.total {
            return None;
        }
        self.cursor += 1;
        Some(self.page(self.cursor).await)
    }

    /// Rewind to the first page.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    struct Blank {
        pages: usize,
    }

    impl Rasterizer for Blank {
        fn page_count(&self, _path: &Path) -> Result<usize, PdfScanError> {
            Ok(self.pages)
        }

        fn render_page(&self, _path: &Path, index: usize, dpi: u32) -> Result<DynamicImage, PdfScanError> {
            if index >= self.pages {
                return Err(PdfScanError::InvalidPageIndex {
                    index,
                    total: self.pages,
                });
            }
            let side = dpi / 72 * 10;
            Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                side,
                side,
                Rgba([255, 255, 255, 255]),
            )))
        }
    }

    #[test]
    fn pdfium_rejects_garbage_with_and_without_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pdf");
        std::fs::write(&path, b"%PDF-1.7\nnot really a pdf").unwrap();

        for rasterizer in [
            PdfiumRasterizer::new(None),
            PdfiumRasterizer::new(Some("secret".into())),
        ] {
            // Internal when no pdfium library is installed, SourceUnreadable otherwise.
            let err = rasterizer.page_count(&path).unwrap_err();
            assert!(
                matches!(
                    err,
                    PdfScanError::SourceUnreadable { .. } | PdfScanError::Internal(_)
                ),
                "unexpected error: {err}"
            );
            assert!(rasterizer.render_page(&path, 0, 72).is_err());
        }
    }

    #[test]
    fn scratch_png_is_deleted_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 3, Rgba([0, 0, 0, 255])));
        let page = write_scratch_png(&img, 2, 144, dir.path()).expect("write");
        let path = page.path().to_path_buf();
        assert!(path.exists());
        assert_eq!((page.width, page.height, page.page_number), (4, 3, 2));
        drop(page);
        assert!(!path.exists());
    }

    #[test]
    fn release_deletes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255])));
        let page = write_scratch_png(&img, 1, 72, dir.path()).unwrap();
        let path = page.path().to_path_buf();
        page.release().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn sequence_is_lazy_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = PageSequence::open(
            Arc::new(Blank { pages: 2 }),
            Path::new("doc.pdf"),
            dir.path(),
            144,
        )
        .await
        .unwrap();
        assert_eq!(seq.len(), 2);

        let first = seq.next_page().await.unwrap().unwrap();
        assert_eq!(first.page_number, 1);
        assert_eq!(first.width, 20);
        let second = seq.next_page().await.unwrap().unwrap();
        assert_eq!(second.page_number, 2);
        assert!(seq.next_page().await.is_none());

        seq.restart();
        let again = seq.next_page().await.unwrap().unwrap();
        assert_eq!(again.page_number, 1);
    }

    #[tokio::test]
    async fn out_of_range_page_is_invalid_index() {
        let dir = tempfile::tempdir().unwrap();
        let seq = PageSequence::open(Arc::new(Blank { pages: 1 }), Path::new("d.pdf"), dir.path(), 72)
            .await
            .unwrap();
        assert!(matches!(
            seq.page(2).await,
            Err(PdfScanError::InvalidPageIndex { index: 1, total: 1 })
        ));
        assert!(matches!(
            seq.page(0).await,
            Err(PdfScanError::InvalidPageIndex { .. })
        ));
    }

    #[tokio::test]
    async fn empty_document_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = PageSequence::open(Arc::new(Blank { pages: 0 }), Path::new("d.pdf"), dir.path(), 72)
            .await
            .unwrap();
        assert!(seq.is_empty());
        assert!(seq.next_page().await.is_none());
    }
}
