/// Trailing window of a captured stream as text, `None` when blank.
pub fn tail_text(bytes: &[u8], max_bytes: usize) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }

    let window = if bytes.len() > max_bytes {
        &bytes[(bytes.len() - max_bytes)..]
    } else {
        bytes
    };

    let text = String::from_utf8_lossy(window).to_string();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

pub fn last_nonempty_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::{last_nonempty_line, tail_text};

    #[test]
    fn tail_keeps_the_end_of_long_streams() {
        let input = [vec![b'a'; 64], b"boom".to_vec()].concat();
        assert_eq!(tail_text(&input, 4).as_deref(), Some("boom"));
    }

    #[test]
    fn blank_streams_have_no_tail() {
        assert_eq!(tail_text(b"  \n\n", 128), None);
        assert_eq!(tail_text(b"", 128), None);
    }

    #[test]
    fn last_line_skips_trailing_blank_lines() {
        let stdout = b"progress 10%\nprogress 100%\n{\"status\":\"ok\"}\n\n";
        assert_eq!(
            last_nonempty_line(stdout).as_deref(),
            Some("{\"status\":\"ok\"}")
        );
        assert_eq!(last_nonempty_line(b"\n \n"), None);
    }
}
