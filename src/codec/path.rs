// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Path encoding/decoding for ownerver requests and `dirall` replies.

/// Encode path segments as `/seg1/seg2...\0` (leading slash per segment,
/// trailing NUL counted in the frame's `payload_len`, no trailing slash).
pub fn encode_path<I, S>(segments: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for seg in segments {
        out.push(b'/');
        out.extend_from_slice(seg.as_ref().as_bytes());
    }
    out.push(0);
    out
}

/// Split a `dirall` reply payload into full paths (comma-separated, no
/// trailing NUL by the time this is called).
pub fn split_dirall(payload: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_end_matches('\0');
    if text.is_empty() {
        return Vec::new();
    }
    text.split(',').map(|s| s.to_string()).collect()
}

/// Keep only the last `/`-delimited segment of a full path, per the
/// dirall-decoding API boundary.
pub fn last_segment(full_path: &str) -> &str {
    full_path.rsplit('/').next().unwrap_or(full_path)
}
