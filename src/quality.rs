//! Download quality presets exposed to clients.

/// Named quality presets. Clients send the lowercase name; anything we do not
/// recognise downloads at `best`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    #[default]
    Best,
    High,
    Medium,
    Low,
    Audio,
}

impl Quality {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Quality::High,
            "medium" => Quality::Medium,
            "low" => Quality::Low,
            "audio" => Quality::Audio,
            _ => Quality::Best,
        }
    }

    /// yt-dlp `--format` selector for the preset.
    pub fn format_selector(self) -> &'static str {
        match self {
            Quality::Best => "bestvideo+bestaudio/best",
            Quality::High => "bestvideo[height<=?720]+bestaudio/best[height<=?720]",
            Quality::Medium => "bestvideo[height<=?480]+bestaudio/best[height<=?480]",
            Quality::Low => "bestvideo[height<=?360]+bestaudio/best[height<=?360]",
            Quality::Audio => "bestaudio/best",
        }
    }

    pub fn is_audio_only(self) -> bool {
        matches!(self, Quality::Audio)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Best => "best",
            Quality::High => "high",
            Quality::Medium => "medium",
            Quality::Low => "low",
            Quality::Audio => "audio",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_presets_fall_back_to_best() {
        assert_eq!(Quality::parse("4k"), Quality::Best);
        assert_eq!(Quality::parse(""), Quality::Best);
        assert_eq!(Quality::parse(" Medium "), Quality::Medium);
    }

    #[test]
    fn selectors_cap_height() {
        assert!(Quality::Low.format_selector().contains("height<=?360"));
        assert!(Quality::High.format_selector().contains("height<=?720"));
        assert_eq!(Quality::Best.format_selector(), "bestvideo+bestaudio/best");
        assert!(Quality::Audio.is_audio_only());
        assert!(!Quality::Best.is_audio_only());
    }
}
