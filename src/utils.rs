use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::errors::Error;

pub fn read_u32_from_buffer(buffer: &[u8]) -> Result<u32, Error> {
    Ok(Cursor::new(buffer).read_u32::<BigEndian>()?)
}

pub fn write_u32_to_buffer(number: u32) -> Result<Vec<u8>, Error> {
    let mut buffer = vec![];

    buffer.write_u32::<BigEndian>(number)?;

    Ok(buffer)
}

/// Generates a fresh sender endpoint id of the form `sender-xxxxxxxxxx`.
pub fn generate_sender_id() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();

    format!("sender-{token}")
}
