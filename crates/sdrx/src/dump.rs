// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Debug dumps and path tracing.
//!
//! Sample dumps go to files whose names and headers are templates:
//! `${time}`, `${sec_now}`, `${newline}`, `${boardserial}` plus any named
//! fields the caller supplies are substituted. A dump file carries an
//! optional expanded header line followed by raw little-endian `f32` IQ
//! pairs, each record prefixed by its 62-bit timestamp.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::dsp::Cf32;
use crate::error::{DeviceError, Result};

/// Template variables available for expansion.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    /// Board serial for `${boardserial}`.
    pub serial: String,
    /// Additional named fields.
    pub fields: Vec<(String, String)>,
}

fn now_parts() -> (u64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_micros()),
        Err(_) => (0, 0),
    }
}

/// Expand a template: `${time}`, `${sec_now}`, `${newline}`,
/// `${boardserial}` and the caller's named fields. Unknown variables are
/// left in place so a typo is visible in the output.
#[must_use]
pub fn expand_template(template: &str, vars: &TemplateVars) -> String {
    let (secs, micros) = now_parts();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = &after[..end];
        match name {
            "time" => out.push_str(&format!("{secs}.{micros:06}")),
            "sec_now" => out.push_str(&secs.to_string()),
            "newline" => out.push('\n'),
            "boardserial" => out.push_str(&vars.serial),
            other => match vars.fields.iter().find(|(n, _)| n == other) {
                Some((_, v)) => out.push_str(v),
                None => {
                    out.push_str("${");
                    out.push_str(other);
                    out.push('}');
                }
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Rolling IQ dump file.
pub struct FileDumper {
    path: PathBuf,
    file: File,
    /// Records written so far.
    pub records: u64,
}

impl FileDumper {
    /// Create a dump file from a path template, writing the expanded
    /// header template first (when given).
    pub fn create(
        path_template: &str,
        header_template: Option<&str>,
        vars: &TemplateVars,
    ) -> Result<Self> {
        let path = PathBuf::from(expand_template(path_template, vars));
        let mut file = File::create(&path).map_err(|e| {
            DeviceError::failure(format!("dump file {}: {e}", path.display()))
        })?;
        if let Some(header) = header_template {
            let line = expand_template(header, vars);
            file.write_all(line.as_bytes())
                .and_then(|()| file.write_all(b"\n"))
                .map_err(|e| DeviceError::failure(format!("dump header: {e}")))?;
        }
        Ok(Self {
            path,
            file,
            records: 0,
        })
    }

    /// Append one record: timestamp then raw `f32` LE IQ pairs.
    pub fn write_iq(&mut self, ts: u64, samples: &[Cf32]) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + samples.len() * 8);
        buf.extend_from_slice(&ts.to_le_bytes());
        for s in samples {
            buf.extend_from_slice(&s.re.to_le_bytes());
            buf.extend_from_slice(&s.im.to_le_bytes());
        }
        self.file
            .write_all(&buf)
            .map_err(|e| DeviceError::failure(format!("dump {}: {e}", self.path.display())))?;
        self.records += 1;
        Ok(())
    }

    /// File path.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// The device's dump slots.
#[derive(Default)]
pub struct DumpSet {
    /// TX sample dump (`bufoutput` with direction tx).
    pub tx: Option<FileDumper>,
    /// RX sample dump (`bufoutput`).
    pub rx: Option<FileDumper>,
    /// RX DC statistics dump (`rxdcoutput`).
    pub rx_dc: Option<FileDumper>,
}

impl DumpSet {
    /// Terminate every open dump.
    pub fn close_all(&mut self) {
        for slot in [&mut self.tx, &mut self.rx, &mut self.rx_dc] {
            if let Some(dump) = slot.take() {
                if dump.records > 0 {
                    warn!(
                        "dump {} closed with {} records",
                        dump.path().display(),
                        dump.records
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars {
            serial: "SER42".into(),
            fields: vec![("rate".into(), "1000000".into())],
        }
    }

    #[test]
    fn test_expand_known_vars() {
        let out = expand_template("s=${boardserial} r=${rate}${newline}", &vars());
        assert_eq!(out, "s=SER42 r=1000000\n");
    }

    #[test]
    fn test_expand_time_forms() {
        let out = expand_template("${sec_now}|${time}", &vars());
        let (secs, rest) = out.split_once('|').expect("two parts");
        assert!(secs.parse::<u64>().is_ok());
        assert!(rest.contains('.'));
    }

    #[test]
    fn test_unknown_var_left_in_place() {
        let out = expand_template("x${nope}y", &vars());
        assert_eq!(out, "x${nope}y");
    }

    #[test]
    fn test_unterminated_var_kept() {
        let out = expand_template("a${broken", &vars());
        assert_eq!(out, "a${broken");
    }

    #[test]
    fn test_file_dumper_writes_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = format!("{}/dump_${{boardserial}}.bin", dir.path().display());
        let mut dump =
            FileDumper::create(&template, Some("board ${boardserial}"), &vars()).expect("create");
        dump.write_iq(7, &[Cf32::new(1.0, -1.0)]).expect("write");
        assert_eq!(dump.records, 1);
        let content = std::fs::read(dump.path()).expect("read back");
        // Header line + 8-byte ts + 8 bytes IQ.
        assert_eq!(content.len(), "board SER42\n".len() + 16);
        assert!(content.starts_with(b"board SER42\n"));
    }
}
