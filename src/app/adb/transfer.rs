//! Progress reporting for `adb push -p`, which prints lines such as `[ 42%] /data/local/tmp/app.apk`.

pub fn parse_progress_percent(line: &str) -> Option<u8> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(inside) = bracketed(trimmed) {
        if let Some(percent) = percent_before_sign(inside) {
            return Some(percent);
        }
    }
    percent_before_sign(trimmed)
}

fn bracketed(input: &str) -> Option<&str> {
    let open = input.find('[')?;
    let close = input[open..].find(']')? + open;
    Some(&input[open + 1..close])
}

/// Up to three digits directly before the first `%`.
fn percent_before_sign(input: &str) -> Option<u8> {
    let sign = input.find('%')?;
    let head = input[..sign].trim_end();
    let digits: String = head
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u8>().ok().filter(|value| *value <= 100)
}

pub fn percent_to_bytes(percent: u8, total: u64) -> u64 {
    let percent = u64::from(percent.min(100));
    total.saturating_mul(percent) / 100
}

/// Splits a chunked byte stream on `\r` and `\n`, since adb redraws its progress line with `\r`.
#[derive(Debug, Default)]
pub struct ProgressLineSplitter {
    pending: String,
}

impl ProgressLineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(index) = self.pending.find(['\r', '\n']) {
            let line = self.pending[..index].trim().to_string();
            self.pending.drain(..=index);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}
