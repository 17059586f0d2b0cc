//! Cleanup of recognizer output.

/// Removes non-speech annotations such as `[BLANK_AUDIO]` or `(wind blowing)`
/// that Whisper style recognizers emit for clicks and background noise.
///
/// Text left with nothing but annotations comes back empty, so it never
/// becomes a transcript.
pub fn strip_non_speech(text: &str) -> String {
    let mut kept = String::with_capacity(text.len());
    let mut closing: Option<char> = None;

    for c in text.chars() {
        match closing {
            Some(close) if c == close => closing = None,
            Some(_) => {}
            None => match c {
                '[' => closing = Some(']'),
                '(' => closing = Some(')'),
                _ => kept.push(c),
            },
        }
    }

    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}
