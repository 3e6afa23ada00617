//! PNG helpers: dimensions, and the `parameters` text chunk carrying
//! generation info

use std::io::Cursor;

use image::{ImageFormat, ImageReader};

use crate::error::{ImageGenError, Result};

/// Keyword of the text chunk holding generation parameters
pub const PARAMETERS_KEYWORD: &str = "parameters";

/// Pixel size of an encoded image of any supported format
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImageGenError::PersistenceFailed(format!("failed to read image: {e}")))?
        .into_dimensions()
        .map_err(|e| ImageGenError::PersistenceFailed(format!("failed to decode image: {e}")))
}

pub fn is_png(bytes: &[u8]) -> bool {
    matches!(image::guess_format(bytes), Ok(ImageFormat::Png))
}

/// Generation parameters embedded in a PNG, if any
///
/// # Errors
///
/// Returns `MetadataParseFailed` if the bytes are not a readable PNG
pub fn read_infotext(bytes: &[u8]) -> Result<Option<String>> {
    let reader = png::Decoder::new(Cursor::new(bytes))
        .read_info()
        .map_err(|e| ImageGenError::MetadataParseFailed(format!("not a readable PNG: {e}")))?;
    let info = reader.info();

    if let Some(chunk) = info
        .uncompressed_latin1_text
        .iter()
        .find(|chunk| chunk.keyword == PARAMETERS_KEYWORD)
    {
        return Ok(Some(chunk.text.clone()));
    }

    if let Some(chunk) = info.utf8_text.iter().find(|chunk| chunk.keyword == PARAMETERS_KEYWORD) {
        return chunk
            .get_text()
            .map(Some)
            .map_err(|e| ImageGenError::MetadataParseFailed(format!("unreadable parameters chunk: {e}")));
    }

    if let Some(chunk) = info
        .compressed_latin1_text
        .iter()
        .find(|chunk| chunk.keyword == PARAMETERS_KEYWORD)
    {
        return chunk
            .get_text()
            .map(Some)
            .map_err(|e| ImageGenError::MetadataParseFailed(format!("unreadable parameters chunk: {e}")));
    }

    Ok(None)
}

/// Encode `bytes` as PNG, embedding `infotext` as the parameters chunk
///
/// PNG input that needs no new chunk is returned unchanged. Other formats
/// are decoded and re-encoded.
///
/// # Errors
///
/// Returns `PersistenceFailed` if the image cannot be decoded or encoded
pub fn to_png(bytes: &[u8], infotext: Option<&str>) -> Result<Vec<u8>> {
    let png = if is_png(bytes) {
        bytes.to_vec()
    } else {
        transcode(bytes)?
    };

    match infotext {
        Some(text) if read_infotext(&png).ok().flatten().as_deref() != Some(text) => embed_infotext(&png, text),
        _ => Ok(png),
    }
}

fn transcode(bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ImageGenError::PersistenceFailed(format!("failed to decode image: {e}")))?;

    let mut out = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| ImageGenError::PersistenceFailed(format!("failed to encode PNG: {e}")))?;

    Ok(out)
}

fn embed_infotext(png_bytes: &[u8], text: &str) -> Result<Vec<u8>> {
    let mut decoder = png::Decoder::new(Cursor::new(png_bytes));
    decoder.set_transformations(png::Transformations::EXPAND);
    let mut reader = decoder
        .read_info()
        .map_err(|e| ImageGenError::PersistenceFailed(format!("failed to decode PNG: {e}")))?;

    // other text chunks (ComfyUI's prompt and workflow) are carried over
    let carried: Vec<(String, String)> = reader
        .info()
        .uncompressed_latin1_text
        .iter()
        .filter(|chunk| chunk.keyword != PARAMETERS_KEYWORD)
        .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
        .collect();

    let mut pixels = vec![0; reader.output_buffer_size()];
    let frame = reader
        .next_frame(&mut pixels)
        .map_err(|e| ImageGenError::PersistenceFailed(format!("failed to decode PNG: {e}")))?;

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, frame.width, frame.height);
        encoder.set_color(frame.color_type);
        encoder.set_depth(frame.bit_depth);

        for (keyword, value) in carried {
            encoder.add_text_chunk(keyword, value).map_err(encoding_failed)?;
        }
        let parameters = if text.chars().all(|c| u32::from(c) <= 0xFF) {
            encoder.add_text_chunk(PARAMETERS_KEYWORD.to_owned(), text.to_owned())
        } else {
            encoder.add_itxt_chunk(PARAMETERS_KEYWORD.to_owned(), text.to_owned())
        };
        parameters.map_err(encoding_failed)?;

        let mut writer = encoder.write_header().map_err(encoding_failed)?;
        writer
            .write_image_data(&pixels[..frame.buffer_size()])
            .map_err(encoding_failed)?;
        writer.finish().map_err(encoding_failed)?;
    }

    Ok(out)
}

fn encoding_failed(e: png::EncodingError) -> ImageGenError {
    ImageGenError::PersistenceFailed(format!("failed to encode PNG: {e}"))
}
