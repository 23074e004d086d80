//! Weather station readouts pushed as `t;p;h` lines.

use serde::{Deserialize, Serialize};

use crate::error::ReadoutError;

/// A readout older than this is reported as inactive.
pub const ACTIVITY_WINDOW_MS: u64 = 30 * 60 * 1000;

/// Latest station values. `ts` is epoch milliseconds, `0` before the first
/// readout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Readout {
    pub t: Option<f64>,
    pub p: Option<f64>,
    pub h: Option<f64>,
    pub ts: u64,
}

impl Readout {
    pub fn is_active(&self, now_epoch_ms: u64) -> bool {
        self.ts != 0 && now_epoch_ms.saturating_sub(self.ts) <= ACTIVITY_WINDOW_MS
    }
}

/// Parses one field. The station firmware prints small negative fractions as
/// `-<int>.0-<frac>`, so `-3.0-5` is `-3.05` and `-3.0-25` is `-3.25`.
pub fn parse_num(field: &str) -> Result<f64, ReadoutError> {
    let field = field.trim();
    let invalid = || ReadoutError::InvalidNumber(field.to_string());

    if let Some((int, frac)) = field.split_once(".0-") {
        let int_ok = int.len() > 1
            && int.starts_with('-')
            && int[1..].bytes().all(|byte| byte.is_ascii_digit());
        let frac_ok = !frac.is_empty() && frac.bytes().all(|byte| byte.is_ascii_digit());
        if int_ok && frac_ok {
            let padded = if frac.len() < 2 { "0" } else { "" };
            return format!("{int}.{padded}{frac}")
                .parse()
                .map_err(|_| invalid());
        }
    }

    field.parse().map_err(|_| invalid())
}

pub fn parse_readout(line: &str, now_epoch_ms: u64) -> Result<Readout, ReadoutError> {
    let fields: Vec<&str> = line.trim().split(';').collect();
    let [t, p, h] = fields.as_slice() else {
        return Err(ReadoutError::FieldCount(fields.len()));
    };

    Ok(Readout {
        t: Some(parse_num(t)?),
        p: Some(parse_num(p)?),
        h: Some(parse_num(h)?),
        ts: now_epoch_ms,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn negative_fraction_quirk() {
        assert_eq!(parse_num("-3.0-5"), Ok(-3.05));
        assert_eq!(parse_num("-3.0-25"), Ok(-3.25));
        assert_eq!(parse_num("-12.0-7"), Ok(-12.07));
    }

    #[test]
    fn plain_numbers_parse_normally() {
        assert_eq!(parse_num("21.5"), Ok(21.5));
        assert_eq!(parse_num("-0.5"), Ok(-0.5));
        assert_eq!(parse_num("1013"), Ok(1013.0));
        assert_eq!(
            parse_num("abc"),
            Err(ReadoutError::InvalidNumber("abc".to_string()))
        );
    }

    #[test]
    fn readout_line() {
        assert_eq!(
            parse_readout("-3.0-5;1013.2;87\n", 1_000),
            Ok(Readout {
                t: Some(-3.05),
                p: Some(1013.2),
                h: Some(87.0),
                ts: 1_000,
            })
        );
        assert_eq!(parse_readout("1;2", 0), Err(ReadoutError::FieldCount(2)));
    }

    #[test]
    fn activity_window() {
        let readout = Readout {
            ts: 1_000,
            ..Readout::default()
        };

        assert!(!Readout::default().is_active(1_000));
        assert!(readout.is_active(1_000 + ACTIVITY_WINDOW_MS));
        assert!(!readout.is_active(1_001 + ACTIVITY_WINDOW_MS));
    }
}
