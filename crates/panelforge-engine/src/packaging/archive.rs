use std::io::{self, Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ForgeError;

/// Stored (uncompressed) archive; generated images are already compressed.
pub fn build_archive(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ForgeError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, bytes) in entries {
        writer
            .start_file(name.as_str(), options)
            .map_err(|err| zip_error(name, err))?;
        writer
            .write_all(bytes)
            .map_err(|err| ForgeError::io(format!("archive {name}"), err))?;
    }
    let cursor = writer.finish().map_err(|err| zip_error("archive", err))?;
    Ok(cursor.into_inner())
}

fn zip_error(context: &str, err: zip::result::ZipError) -> ForgeError {
    ForgeError::io(format!("archive {context}"), io::Error::other(err.to_string()))
}
