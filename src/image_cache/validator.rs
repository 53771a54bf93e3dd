//! Content validation for downloaded image bytes.
//!
//! CDNs occasionally answer 200 with an HTML error page or a truncated blob,
//! and the Content-Type header is unreliable, so the file header sniff is the
//! canonical format decision.

/// Image formats the cache accepts, with their canonical file extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Ico,
    Avif,
    Webp,
}

impl ImageFormat {
    /// Canonical extension used for cache file names.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Ico => "ico",
            ImageFormat::Avif => "avif",
            ImageFormat::Webp => "webp",
        }
    }

    /// All accepted formats, used to probe existing cache files by extension.
    pub fn all() -> &'static [ImageFormat] {
        &[
            ImageFormat::Png,
            ImageFormat::Jpeg,
            ImageFormat::Gif,
            ImageFormat::Bmp,
            ImageFormat::Ico,
            ImageFormat::Avif,
            ImageFormat::Webp,
        ]
    }

    /// MIME types for the Accept header on image requests.
    pub fn accept_header() -> &'static str {
        "image/png,image/jpeg,image/gif,image/bmp,image/x-icon,image/avif,image/webp,image/*;q=0.8"
    }

    /// Sniff the leading bytes of a downloaded blob.
    ///
    /// Returns `None` for anything that is not a recognized image, including
    /// formats `infer` knows but the cache does not accept.
    pub fn sniff(bytes: &[u8]) -> Option<ImageFormat> {
        let kind = infer::get(bytes)?;
        match kind.mime_type() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" => Some(ImageFormat::Jpeg),
            "image/gif" => Some(ImageFormat::Gif),
            "image/bmp" => Some(ImageFormat::Bmp),
            "image/vnd.microsoft.icon" | "image/x-icon" => Some(ImageFormat::Ico),
            "image/avif" => Some(ImageFormat::Avif),
            "image/webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }
}
