//! FITS primary header reader
//!
//! A FITS header is a sequence of 2880-byte blocks holding 80-character
//! cards, terminated by the `END` card. Only the primary HDU header is read;
//! pixel data is never touched.

use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{Acquisition, FrameHeader, FrameType, QualityMetrics};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
/// Headers longer than this are treated as corrupt
const MAX_HEADER_BLOCKS: usize = 64;

/// Card name -> value text, quotes and comments removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawHeader {
    pub cards: BTreeMap<String, String>,
}

impl RawHeader {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            cards: pairs
                .into_iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, card: &str) -> Option<&str> {
        self.cards
            .get(card)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn text(&self, card: &str) -> Option<String> {
        self.get(card).map(str::to_string)
    }

    fn number(&self, card: &str) -> Option<f64> {
        self.get(card)
            .and_then(|v| v.replace(['D', 'd'], "E").parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    fn integer(&self, card: &str) -> Option<i64> {
        self.number(card)
            .filter(|v| v.fract() == 0.0)
            .map(|v| v as i64)
    }

    fn first_number(&self, cards: &[&str]) -> Option<f64> {
        cards.iter().find_map(|card| self.number(card))
    }

    /// Typed view of the header used for ingestion
    pub fn to_frame_header(&self) -> ArchiveResult<FrameHeader> {
        let imagetyp = self
            .get("IMAGETYP")
            .ok_or_else(|| ArchiveError::InvalidInput("FITS header has no IMAGETYP card".to_string()))?;
        let frame_type = FrameType::from_imagetyp(imagetyp).ok_or_else(|| {
            ArchiveError::InvalidInput(format!("unrecognized IMAGETYP '{}'", imagetyp))
        })?;

        let binning_x = self.integer("XBINNING").filter(|b| *b > 0);
        let binning_y = self.integer("YBINNING").filter(|b| *b > 0).or(binning_x);

        Ok(FrameHeader {
            frame_type,
            object_name: self.text("OBJECT"),
            date_obs: self.get("DATE-OBS").and_then(parse_date_obs),
            acquisition: Acquisition {
                telescope: self.text("TELESCOP"),
                instrument: self.text("INSTRUME"),
                filter: self.text("FILTER"),
                exposure: self.first_number(&["EXPTIME", "EXPOSURE"]),
                binning_x,
                binning_y,
                ccd_temp: self.number("CCD-TEMP"),
                gain: self.number("GAIN"),
                offset: self.number("OFFSET"),
            },
            observer: self.text("OBSERVER"),
            notes: None,
            quality: QualityMetrics {
                avg_fwhm: self.number("FWHM"),
                avg_eccentricity: self.number("ECCENTRICITY"),
                avg_hfr: self.number("HFR"),
                image_snr: self.number("SNR"),
                star_count: self.integer("STARS"),
                image_scale: self.first_number(&["IMAGESCALE", "SCALE"]),
            },
        })
    }
}

/// Read the primary header of a FITS file
pub fn read_header(path: &Path) -> ArchiveResult<RawHeader> {
    let mut file = File::open(path)?;
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut header = RawHeader::default();

    for block_index in 0..MAX_HEADER_BLOCKS {
        file.read_exact(&mut block).map_err(|e| {
            ArchiveError::InvalidInput(format!(
                "{}: truncated FITS header ({})",
                path.display(),
                e
            ))
        })?;

        if block_index == 0 && !block.starts_with(b"SIMPLE  =") {
            return Err(ArchiveError::InvalidInput(format!(
                "{}: not a FITS file",
                path.display()
            )));
        }

        for card in block.chunks_exact(CARD_SIZE) {
            let card = String::from_utf8_lossy(card);
            let keyword = card.get(..8).unwrap_or_default().trim_end();

            if keyword == "END" {
                return Ok(header);
            }
            if let Some(value) = parse_card_value(&card) {
                header.cards.insert(keyword.to_string(), value);
            }
        }
    }

    Err(ArchiveError::InvalidInput(format!(
        "{}: no END card within {} header blocks",
        path.display(),
        MAX_HEADER_BLOCKS
    )))
}

/// Value of a `KEYWORD = value / comment` card; `None` for commentary cards
fn parse_card_value(card: &str) -> Option<String> {
    if card.get(8..10) != Some("= ") {
        return None;
    }
    let rest = card.get(10..)?.trim_start();

    if let Some(quoted) = rest.strip_prefix('\'') {
        // '' inside a string is an escaped quote
        let mut value = String::new();
        let mut chars = quoted.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    value.push('\'');
                    chars.next();
                } else {
                    break;
                }
            } else {
                value.push(c);
            }
        }
        return Some(value.trim_end().to_string());
    }

    let value = rest.split('/').next().unwrap_or_default().trim();
    Some(value.to_string())
}

/// `DATE-OBS` in the forms written by capture software, taken as UTC
fn parse_date_obs(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = value.trim_end_matches('Z');
    if let Ok(ts) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}
