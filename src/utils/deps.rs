use crate::config::FfmpegConfig;
use std::process::{Command, Stdio};

/// Availability of the external tools the pipeline shells out to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStatus {
    pub ffmpeg: bool,
    pub ffprobe: bool,
}

impl DependencyStatus {
    pub fn check(config: &FfmpegConfig) -> Self {
        Self {
            ffmpeg: check_command(&config.ffmpeg, &["-version"]),
            ffprobe: check_command(&config.ffprobe, &["-version"]),
        }
    }

    pub fn all_present(&self) -> bool {
        self.ffmpeg && self.ffprobe
    }

    /// Names of tools that could not be run
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.ffmpeg {
            missing.push("ffmpeg");
        }
        if !self.ffprobe {
            missing.push("ffprobe");
        }
        missing
    }

    pub fn report(&self) -> String {
        let mark = |ok: bool| if ok { "found" } else { "MISSING" };
        format!("ffmpeg: {}\nffprobe: {}", mark(self.ffmpeg), mark(self.ffprobe))
    }
}

/// Check if a command is available
fn check_command(cmd: &str, args: &[&str]) -> bool {
    Command::new(cmd)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tools() {
        let config = FfmpegConfig {
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            ffprobe: "/nonexistent/ffprobe".to_string(),
            ..FfmpegConfig::default()
        };
        let status = DependencyStatus::check(&config);
        assert!(!status.all_present());
        assert_eq!(status.missing(), vec!["ffmpeg", "ffprobe"]);
        assert!(status.report().contains("ffprobe: MISSING"));
    }

    #[cfg(unix)]
    #[test]
    fn test_present_tool() {
        assert!(check_command("/bin/sh", &["-c", "exit 0"]));
        assert!(!check_command("/bin/sh", &["-c", "exit 3"]));
    }
}
