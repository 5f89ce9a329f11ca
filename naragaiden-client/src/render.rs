//! Plain-text rendering of a [`ViewModel`] for terminals.

use std::fmt::Write;

use naragaiden_core::{TimeColors, ViewModel};

pub const EMPTY_TEXT: &str = "No data";
pub const OPEN_GLYPH: &str = "\u{2197}";
pub const OPEN_GLYPH_ARMED: &str = "\u{21d7}";

const NAME_WIDTH: usize = 14;
const EVENT_WIDTH: usize = 24;

/// Screen state owned by the render loop.
#[derive(Debug, Clone, Default)]
pub struct Screen {
    view: Option<ViewModel>,
}

impl Screen {
    pub fn show(&mut self, view: ViewModel) {
        self.view = Some(view);
    }

    /// Replaces only the status line of the current view.
    pub fn set_status(&mut self, status: String) {
        let view = self.view.get_or_insert_with(|| ViewModel {
            status_line: String::new(),
            updated_line: String::new(),
            rows: Vec::new(),
            armed: false,
        });
        view.status_line = status;
    }

    pub fn view(&self) -> Option<&ViewModel> {
        self.view.as_ref()
    }
}

pub fn render_text(view: &ViewModel, ansi: bool) -> String {
    let mut out = String::new();
    let glyph = if view.armed {
        OPEN_GLYPH_ARMED
    } else {
        OPEN_GLYPH
    };
    let _ = writeln!(out, "{}  {glyph}", view.status_line);

    if view.is_empty() {
        let _ = writeln!(out, "{EMPTY_TEXT}");
    } else {
        let _ = writeln!(
            out,
            "{}{}{}",
            pad("Baby", NAME_WIDTH),
            pad("Latest Feed", EVENT_WIDTH),
            "Latest Diaper"
        );
        for row in &view.rows {
            let _ = writeln!(
                out,
                "{}{}{}",
                pad(&row.name, NAME_WIDTH),
                pad(&row.feed_label, EVENT_WIDTH),
                row.diaper_label
            );
            let _ = writeln!(
                out,
                "{}{}{}",
                pad("", NAME_WIDTH),
                badge(&row.feed_relative, row.feed_colors, EVENT_WIDTH, ansi),
                badge(&row.diaper_relative, row.diaper_colors, 0, ansi)
            );
        }
    }

    let _ = writeln!(out, "{}", view.updated_line);
    out
}

fn pad(text: &str, width: usize) -> String {
    let len = text.chars().count();
    if len >= width {
        format!("{text} ")
    } else {
        format!("{text}{}", " ".repeat(width - len))
    }
}

fn badge(text: &str, colors: TimeColors, width: usize, ansi: bool) -> String {
    let label = format!("[{text}]");
    let padding = width.saturating_sub(label.chars().count());
    if !ansi {
        return format!("{label}{}", " ".repeat(padding));
    }
    let bg = colors.background;
    let fg = colors.foreground;
    format!(
        "\x1b[48;2;{};{};{}m\x1b[38;2;{};{};{}m{label}\x1b[0m{}",
        bg.r,
        bg.g,
        bg.b,
        fg.r,
        fg.g,
        fg.b,
        " ".repeat(padding)
    )
}

#[cfg(test)]
mod tests {
    use naragaiden_core::{NEUTRAL_COLORS, Rgb, RowView};

    use super::*;

    fn row() -> RowView {
        RowView {
            id: "child-1".to_owned(),
            name: "Ava".to_owned(),
            feed_label: "Bottle".to_owned(),
            feed_relative: "20 mins ago".to_owned(),
            feed_colors: TimeColors {
                background: Rgb::new(27, 94, 32),
                foreground: Rgb::WHITE,
            },
            diaper_label: "Wet".to_owned(),
            diaper_relative: "unknown".to_owned(),
            diaper_colors: NEUTRAL_COLORS,
        }
    }

    #[test]
    fn empty_view_says_no_data() {
        let view = ViewModel {
            status_line: "Error: HTTP 500".to_owned(),
            updated_line: "as of --".to_owned(),
            rows: Vec::new(),
            armed: false,
        };
        let text = render_text(&view, false);
        assert!(text.starts_with("Error: HTTP 500"));
        assert!(text.contains(EMPTY_TEXT));
        assert!(text.trim_end().ends_with("as of --"));
    }

    #[test]
    fn rows_show_labels_and_badges() {
        let view = ViewModel {
            status_line: "Nara Gaiden".to_owned(),
            updated_line: "Updated: 3:07 PM".to_owned(),
            rows: vec![row()],
            armed: true,
        };
        let plain = render_text(&view, false);
        assert!(plain.contains(OPEN_GLYPH_ARMED));
        assert!(plain.contains("Bottle"));
        assert!(plain.contains("[20 mins ago]"));
        assert!(plain.contains("[unknown]"));
        assert!(!plain.contains('\x1b'));

        let colored = render_text(&view, true);
        assert!(colored.contains("\x1b[48;2;27;94;32m"));
        assert!(colored.contains("\x1b[48;2;51;51;51m"));
    }

    #[test]
    fn status_can_change_without_a_view() {
        let mut screen = Screen::default();
        screen.set_status("Tap 2x to launch Nara Baby".to_owned());
        assert_eq!(
            screen.view().map(|v| v.status_line.as_str()),
            Some("Tap 2x to launch Nara Baby")
        );
        assert!(screen.view().is_some_and(ViewModel::is_empty));
    }
}
