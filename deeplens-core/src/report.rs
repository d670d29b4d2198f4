//! Serial-style result reporting to the host.
//!
//! Each post-processor emits one textual message per result with a stable
//! format, so a host listening on the camera's serial link can parse them:
//!
//! - classification: `RC <id> <name> <score>` (score in percent)
//! - detection: `DO <id> <name> <score> <x> <y> <w> <h>` (image pixels)

use deeplens_utils::rect::Rect;

/// Receives serial-style result lines, one per result.
pub trait ReportSink {
    fn send(&mut self, line: &str);
}

/// Default sink that forwards messages to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn send(&mut self, line: &str) {
        log::info!("{line}");
    }
}

/// Sink that collects messages; used by tests and batch runs.
#[derive(Debug, Default)]
pub struct VecSink {
    pub lines: Vec<String>,
}

impl ReportSink for VecSink {
    fn send(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }
}

/// Serial line for one recognized class.
pub fn class_msg(id: i32, name: &str, score: f32) -> String {
    format!("RC {id} {name} {:.1}", score * 100.0)
}

/// Serial line for one detected object.
pub fn object_msg(id: i32, name: &str, score: f32, rect: Rect) -> String {
    format!(
        "DO {id} {name} {:.1} {} {} {} {}",
        score * 100.0,
        rect.x,
        rect.y,
        rect.width,
        rect.height
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_have_stable_format() {
        assert_eq!(class_msg(3, "cat", 0.876), "RC 3 cat 87.6");
        assert_eq!(
            object_msg(0, "person", 0.5, Rect::new(10, 20, 30, 40)),
            "DO 0 person 50.0 10 20 30 40"
        );
    }
}
