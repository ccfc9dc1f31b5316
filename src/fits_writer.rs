// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Minimal FITS writer: a primary HDU holding one 16 bit unsigned image
//! (stored as BITPIX=16 with BZERO=32768) and a list of header cards.

use std::io::{self, Write};

use crate::frame::Image16;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

#[derive(Clone, Debug, PartialEq)]
pub enum CardValue {
    Logical(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Undefined,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeaderCard {
    pub keyword: &'static str,
    pub value: CardValue,
    pub comment: &'static str,
}

impl HeaderCard {
    pub fn new(keyword: &'static str, value: CardValue, comment: &'static str) -> Self {
        HeaderCard{keyword, value, comment}
    }

    fn format(&self) -> String {
        let value = match &self.value {
            CardValue::Logical(b) => format!("{:>20}", if *b { "T" } else { "F" }),
            CardValue::Integer(i) => format!("{:>20}", i),
            CardValue::Real(r) if r.is_finite() => format!("{:>20}", format!("{:.6}", r)),
            CardValue::Real(_) | CardValue::Undefined => " ".repeat(20),
            CardValue::Text(s) => {
                let quoted = format!("'{:<8}'", s.replace('\'', "''"));
                format!("{:<20}", quoted)
            },
        };
        let mut card = format!("{:<8}= {}", self.keyword, value);
        if !self.comment.is_empty() {
            card.push_str(" / ");
            card.push_str(self.comment);
        }
        card.truncate(CARD_SIZE);
        format!("{:<80}", card)
    }
}

fn pad_to_block<W: Write>(writer: &mut W, written: usize, fill: u8) -> io::Result<()> {
    let remainder = written % BLOCK_SIZE;
    if remainder != 0 {
        writer.write_all(&vec![fill; BLOCK_SIZE - remainder])?;
    }
    Ok(())
}

/// Writes `image` with the mandatory structural cards followed by `cards`.
pub fn write_fits<W: Write>(writer: &mut W, image: &Image16, cards: &[HeaderCard])
                            -> io::Result<()> {
    let (width, height) = image.dimensions();
    let mut header = vec![
        HeaderCard::new("SIMPLE", CardValue::Logical(true), "conforms to FITS standard"),
        HeaderCard::new("BITPIX", CardValue::Integer(16), "array data type"),
        HeaderCard::new("NAXIS", CardValue::Integer(2), "number of array dimensions"),
        HeaderCard::new("NAXIS1", CardValue::Integer(width as i64), ""),
        HeaderCard::new("NAXIS2", CardValue::Integer(height as i64), ""),
        HeaderCard::new("BZERO", CardValue::Integer(32768), "offset data range to unsigned"),
        HeaderCard::new("BSCALE", CardValue::Integer(1), "default scaling factor"),
    ];
    header.extend_from_slice(cards);

    let mut header_bytes = String::with_capacity((header.len() + 1) * CARD_SIZE);
    for card in &header {
        header_bytes.push_str(&card.format());
    }
    header_bytes.push_str(&format!("{:<80}", "END"));
    writer.write_all(header_bytes.as_bytes())?;
    pad_to_block(writer, header_bytes.len(), b' ')?;

    let mut data = Vec::<u8>::with_capacity(image.as_raw().len() * 2);
    for pixel in image.as_raw() {
        let stored = (*pixel as i32 - 32768) as i16;
        data.extend_from_slice(&stored.to_be_bytes());
    }
    writer.write_all(&data)?;
    pad_to_block(writer, data.len(), 0)
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Luma};
    use super::*;

    #[test]
    fn test_card_format() {
        let card = HeaderCard::new("EXPTIME", CardValue::Real(1.5), "seconds");
        let text = card.format();
        assert_eq!(text.len(), 80);
        assert!(text.starts_with("EXPTIME =             1.500000 / seconds"));

        let card = HeaderCard::new("CAMID", CardValue::Text("it's".to_string()), "");
        assert!(card.format().starts_with("CAMID   = 'it''s   '"));

        let card = HeaderCard::new("TEMP-LCK", CardValue::Logical(false), "");
        assert!(card.format().starts_with("TEMP-LCK=                    F"));

        let card = HeaderCard::new("CCD-TEMP", CardValue::Undefined, "");
        assert_eq!(card.format().trim_end(), "CCD-TEMP=");
    }

    #[test]
    fn test_write_fits() {
        let image: Image16 = ImageBuffer::from_fn(3, 2, |x, y| Luma([(x + 10 * y) as u16]));
        let mut buf = Vec::<u8>::new();
        let cards = vec![HeaderCard::new("EXPCNT", CardValue::Integer(7), "")];
        write_fits(&mut buf, &image, &cards).unwrap();

        assert_eq!(buf.len(), 2 * BLOCK_SIZE);
        let header = std::str::from_utf8(&buf[..BLOCK_SIZE]).unwrap();
        assert!(header.starts_with("SIMPLE  ="));
        assert!(header.contains("NAXIS1  =                    3"));
        assert!(header.contains("EXPCNT  =                    7"));
        assert!(header.contains(&format!("{:<80}", "END")));

        // First pixel is 0, stored as -32768.
        assert_eq!(&buf[BLOCK_SIZE..BLOCK_SIZE + 2], &(-32768_i16).to_be_bytes());
        // Pixel (0, 1) is 10.
        let offset = BLOCK_SIZE + 2 * 3;
        assert_eq!(&buf[offset..offset + 2], &(10_i32 - 32768).to_be_bytes()[2..]);
    }

}  // mod tests.
