//! Single byte-range parsing for `Range: bytes=...` request headers.

/// Inclusive byte span within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// `Content-Range` value for a file of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{total}", self.start, self.end)
    }
}

/// How a `Range` header applies to a file of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSelection {
    /// No usable range: serve the whole file with `200`.
    Full,
    /// Serve the given span with `206`.
    Partial(ByteRange),
    /// Well-formed but outside the file: answer `416`.
    Unsatisfiable,
}

/// Interpret `header` against a file of `len` bytes.
///
/// Malformed headers, units other than `bytes` and multi-range requests are
/// ignored and fall back to [`RangeSelection::Full`].
pub fn select(header: Option<&str>, len: u64) -> RangeSelection {
    let Some(header) = header else {
        return RangeSelection::Full;
    };
    let Some((unit, ranges)) = header.trim().split_once('=') else {
        return RangeSelection::Full;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") || ranges.contains(',') {
        return RangeSelection::Full;
    }
    let Some((first, last)) = ranges.trim().split_once('-') else {
        return RangeSelection::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix form: the final `n` bytes.
        let Ok(suffix) = last.parse::<u64>() else {
            return RangeSelection::Full;
        };
        if suffix == 0 || len == 0 {
            return RangeSelection::Unsatisfiable;
        }
        return RangeSelection::Partial(ByteRange {
            start: len.saturating_sub(suffix),
            end: len - 1,
        });
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeSelection::Full;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return RangeSelection::Full,
        }
    };

    if start >= len {
        return RangeSelection::Unsatisfiable;
    }

    let end = end.map_or(len - 1, |end| end.min(len - 1));
    RangeSelection::Partial(ByteRange { start, end })
}
