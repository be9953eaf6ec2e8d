//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Zi.
//! The Zi project belongs to the Dunimd project team.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;

use zi_orbit::{ZiReportedState, ZiSession};
use zip::write::FileOptions;

/// Answers every request line with `{"id":<same id>,"result":"ok"}`.
pub const ECHO_SCRIPT: &str = r#"#!/bin/sh
echo "echo plugin ready"
echo "booting" >&2
while IFS= read -r line; do
  id=${line#*'"id":"'}
  id=${id%%'"'*}
  printf '{"id":"%s","result":"ok"}\n' "$id"
done
"#;

pub fn build_archive(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body, mode) in entries {
        let options = FileOptions::default().unix_permissions(*mode);
        writer.start_file(*name, options).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Set extra Unix mode bits (setuid and friends) on one stored entry.
///
/// `FileOptions::unix_permissions` keeps only `0o777`, so the central
/// directory record is patched in place.
pub fn add_mode_bits(mut bin: Vec<u8>, entry: &str, bits: u32) -> Vec<u8> {
    const CENTRAL_HEADER: [u8; 4] = [0x50, 0x4b, 0x01, 0x02];
    let mut at = 0;
    while at + 46 <= bin.len() {
        if bin[at..at + 4] == CENTRAL_HEADER {
            let name_len = u16::from_le_bytes([bin[at + 28], bin[at + 29]]) as usize;
            if &bin[at + 46..at + 46 + name_len] == entry.as_bytes() {
                let attrs = at + 38;
                let mut external = u32::from_le_bytes([bin[attrs], bin[attrs + 1], bin[attrs + 2], bin[attrs + 3]]);
                external |= bits << 16;
                bin[attrs..attrs + 4].copy_from_slice(&external.to_le_bytes());
                return bin;
            }
        }
        at += 1;
    }
    panic!("entry {} not found in archive", entry);
}

pub fn manifest_json(id: &str) -> Vec<u8> {
    format!(r#"{{"id":"{}","name":"Test {}","capabilities":["echo"]}}"#, id, id).into_bytes()
}

/// Archive with a manifest and a `main` shell script.
pub fn script_archive(id: &str, script: &str) -> Vec<u8> {
    build_archive(&[
        ("manifest.json", &manifest_json(id), 0o644),
        ("main", script.as_bytes(), 0o755),
    ])
}

pub fn dir_entries(path: &Path) -> usize {
    std::fs::read_dir(path).map(|entries| entries.count()).unwrap_or(0)
}

pub async fn wait_for_state(session: &ZiSession, state: ZiReportedState) {
    for _ in 0..400 {
        if session.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session never reached {}, last report {:?}", state, session.report());
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
