// weather_streams - Running per-station weather averages exported as Prometheus metrics
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::error;
use std::fmt;

const DELIMITER: char = ',';
const FIELD_STATION: &str = "station";
const FIELD_TEMPERATURE: &str = "temperature";
const FIELD_HUMIDITY: &str = "humidity";

/// Reason a raw record could not be turned into a `Reading`.
///
/// Records that fail to parse are noise: the pipeline drops them without
/// touching any aggregate state.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    MissingField(&'static str),
    EmptyStation,
    InvalidNumber { field: &'static str, value: String },
    NonFinite { field: &'static str },
    InvalidEncoding,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing {} field", field),
            Self::EmptyStation => write!(f, "empty station identifier"),
            Self::InvalidNumber { field, value } => write!(f, "invalid {} value {:?}", field, value),
            Self::NonFinite { field } => write!(f, "non-finite {} value", field),
            Self::InvalidEncoding => write!(f, "record is not valid UTF-8"),
        }
    }
}

impl error::Error for ParseError {}

/// Validated reading in the units it was reported in.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub station: String,
    pub temperature_c: f64,
    pub humidity: f64,
}

impl Reading {
    /// Parse a `<station>,<temperatureC>,<humidity>` record.
    ///
    /// At least three fields are required, anything after the third is ignored.
    /// Whitespace around the numeric fields is allowed. The station is kept
    /// verbatim since it becomes the aggregation key.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let mut fields = raw.split(DELIMITER);

        let station = fields.next().ok_or(ParseError::MissingField(FIELD_STATION))?;
        let temperature = fields.next().ok_or(ParseError::MissingField(FIELD_TEMPERATURE))?;
        let humidity = fields.next().ok_or(ParseError::MissingField(FIELD_HUMIDITY))?;

        if station.is_empty() {
            return Err(ParseError::EmptyStation);
        }

        Ok(Reading {
            station: station.to_owned(),
            temperature_c: parse_number(FIELD_TEMPERATURE, temperature)?,
            humidity: parse_number(FIELD_HUMIDITY, humidity)?,
        })
    }

    /// Parse a record as read from the input, rejecting bytes that are not UTF-8.
    pub fn parse_bytes(raw: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidEncoding)?;
        Self::parse(text)
    }

    /// Convert to Fahrenheit, leaving humidity untouched. No rounding is done here.
    pub fn to_fahrenheit(&self) -> ConvertedReading {
        ConvertedReading {
            station: self.station.clone(),
            temperature_f: self.temperature_c * 9.0 / 5.0 + 32.0,
            humidity: self.humidity,
        }
    }
}

/// Reading after unit conversion, ready to be aggregated.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedReading {
    pub station: String,
    pub temperature_f: f64,
    pub humidity: f64,
}

impl ConvertedReading {
    /// Key used for aggregation, always taken from the converted record and never
    /// from whatever key the record arrived with.
    pub fn key(&self) -> &str {
        &self.station
    }
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, ParseError> {
    let n = value
        .trim()
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidNumber {
            field,
            value: value.to_owned(),
        })?;

    if n.is_finite() {
        Ok(n)
    } else {
        Err(ParseError::NonFinite { field })
    }
}
