use base64::Engine;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;

/// A task image after transport decoding.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Base64 body without any scheme prefix.
    pub base64: String,
}

impl DecodedImage {
    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    /// `data:` URI for backends that take images inline.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), self.base64)
    }
}

/// Strip a `scheme,` prefix such as `data:image/png;base64,`.
pub fn strip_scheme(image_data: &str) -> &str {
    match image_data.split_once(',') {
        Some((_, body)) => body,
        None => image_data,
    }
}

/// Decode a task payload into an image.
///
/// Any failure here is permanent for the message: the same bytes will never
/// decode on a later delivery.
pub fn decode_image(image_data: &str) -> Result<DecodedImage, DecodeError> {
    let body: String = strip_scheme(image_data)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if body.is_empty() {
        return Err(DecodeError::Empty);
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(&body)?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let format = image::guess_format(&bytes).map_err(DecodeError::NotAnImage)?;
    let (width, height) = ImageReader::with_format(Cursor::new(&bytes), format)
        .into_dimensions()
        .map_err(DecodeError::NotAnImage)?;

    Ok(DecodedImage {
        bytes,
        format,
        width,
        height,
        base64: body,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Image payload is empty")]
    Empty,

    #[error("Image payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Payload is not a readable image: {0}")]
    NotAnImage(image::ImageError),
}
