//! Minimal FITS file generation for tests
//!
//! Produces a primary header (SIMPLE/BITPIX/NAXIS plus the requested cards)
//! followed by one data block, which is all the header reader needs.

const BLOCK_SIZE: usize = 2880;

#[derive(Debug, Clone)]
pub struct FitsFrame {
    pub cards: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl FitsFrame {
    /// Frame on telescope T1 / camera CAM1 at 1x1 binning
    pub fn new(imagetyp: &str, date_obs: &str) -> Self {
        Self {
            cards: Vec::new(),
            payload: b"pixels".to_vec(),
        }
        .card("IMAGETYP", imagetyp)
        .card("DATE-OBS", date_obs)
        .card("TELESCOP", "T1")
        .card("INSTRUME", "CAM1")
        .card("XBINNING", "1")
        .card("YBINNING", "1")
    }

    pub fn light(object: &str, filter: &str, date_obs: &str) -> Self {
        Self::new("Light Frame", date_obs)
            .card("OBJECT", object)
            .card("FILTER", filter)
            .card("EXPTIME", "300")
    }

    pub fn dark(exposure: f64, date_obs: &str) -> Self {
        Self::new("Dark Frame", date_obs).card("EXPTIME", &exposure.to_string())
    }

    pub fn flat(filter: &str, date_obs: &str) -> Self {
        Self::new("Flat Field", date_obs)
            .card("FILTER", filter)
            .card("EXPTIME", "2.5")
    }

    pub fn bias(date_obs: &str) -> Self {
        Self::new("Bias Frame", date_obs).card("EXPTIME", "0")
    }

    /// Set or replace a card
    pub fn card(mut self, key: &str, value: &str) -> Self {
        self.cards.retain(|(k, _)| k != key);
        self.cards.push((key.to_string(), value.to_string()));
        self
    }

    pub fn without(mut self, key: &str) -> Self {
        self.cards.retain(|(k, _)| k != key);
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = String::new();
        header.push_str(&card_line("SIMPLE", "T"));
        header.push_str(&card_line("BITPIX", "8"));
        header.push_str(&card_line("NAXIS", "0"));
        for (key, value) in &self.cards {
            let formatted = if is_numeric(value) {
                value.clone()
            } else {
                format!("'{}'", value.replace('\'', "''"))
            };
            header.push_str(&card_line(key, &formatted));
        }
        header.push_str(&format!("{:<80}", "END"));

        let mut bytes = header.into_bytes();
        pad(&mut bytes, b' ');

        let mut data = self.payload.clone();
        pad(&mut data, 0);
        bytes.extend(data);
        bytes
    }

    /// Write the file; returns its bytes
    pub fn write_to(&self, path: &std::path::Path) -> Vec<u8> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let bytes = self.to_bytes();
        std::fs::write(path, &bytes).unwrap();
        bytes
    }
}

fn card_line(key: &str, value: &str) -> String {
    let line = format!("{:<8}= {:<70}", key, value);
    line.chars().take(80).collect()
}

fn is_numeric(value: &str) -> bool {
    value == "T" || value == "F" || value.parse::<f64>().is_ok()
}

fn pad(bytes: &mut Vec<u8>, fill: u8) {
    let padded = bytes.len().div_ceil(BLOCK_SIZE).max(1) * BLOCK_SIZE;
    bytes.resize(padded, fill);
}
