/// Remembers how many container log lines were already printed.
#[derive(Debug, Default)]
pub struct LogCursor {
    printed: usize,
}

impl LogCursor {
    pub fn printed(&self) -> usize {
        self.printed
    }

    /// Lines to print now. `show_all` returns everything and leaves the cursor
    /// alone; otherwise only lines past the cursor are returned and the cursor
    /// advances to the end.
    pub fn select<'a>(&mut self, lines: &'a [String], show_all: bool) -> &'a [String] {
        if show_all {
            return lines;
        }
        // Fewer lines than before means the log was rotated or recreated.
        let start = if self.printed > lines.len() { 0 } else { self.printed };
        self.printed = lines.len();
        &lines[start..]
    }
}

/// Last `n` lines.
pub fn tail(lines: &[String], n: usize) -> Vec<String> {
    lines[lines.len().saturating_sub(n)..].to_vec()
}
