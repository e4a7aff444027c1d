//! Display/input bridge
//!
//! A character grid with independent background and foreground color
//! planes. Printable bytes advance the cursor; control bytes implement
//! newline, backspace (which never deletes past the input mark),
//! carriage return, and clear-screen. An `\x1b<letter><hex>\x1b`
//! escape protocol drives color state and the color stacks; malformed
//! sequences are dropped silently.
//!
//! The bridge also owns line-input mode and the cycle auto-tuner that
//! trades instructions-per-tick against the observed framerate.

/// Default grid height
pub const DEFAULT_ROWS: usize = 30;
/// Default grid width
pub const DEFAULT_COLS: usize = 84;
/// Starting per-tick cycle budget
pub const DEFAULT_CYCLE: u32 = 1000;
/// Lower cycle clamp
pub const MIN_CYCLE: u32 = 10;
/// Upper cycle clamp
pub const MAX_CYCLE: u32 = 100_000_000;
/// Framerate below which the budget halves
pub const FPS_LOW: f64 = 30.0;
/// Framerate above which the budget doubles
pub const FPS_HIGH: f64 = 48.0;
/// Ticks the tuner holds a new value before moving again
pub const STABLE_WINDOW: u32 = 100;

const DEFAULT_BG: u32 = 0xFF00_0000;
const DEFAULT_FG: u32 = 0xFFE0_E0E0;

/// Outcome of feeding one key event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// Key handled (echoed, edited, or ignored)
    Consumed,
    /// A line was committed and waits in the input buffer
    Committed,
    /// Ctrl-C: the caller should raise the global interrupt flag
    Interrupt,
}

/// Escape-protocol parser state
#[derive(Debug, Clone, PartialEq, Eq)]
enum EscapeState {
    Idle,
    /// Saw the opening escape byte
    Begin,
    /// Accumulating the command payload
    Body { cmd: u8, buf: String },
    /// Malformed sequence: swallow bytes until the terminator
    Skip,
}

/// Auto-tunes the per-tick instruction budget from the framerate
///
/// Above the upper bound the budget doubles (capped); below the lower
/// bound it halves (floored). After each move the value holds for a
/// stability window. An explicit `set_cycle` pins the value.
#[derive(Debug)]
pub struct CycleTuner {
    cycle: u32,
    stable: u32,
    pinned: bool,
}

impl Default for CycleTuner {
    fn default() -> Self {
        CycleTuner {
            cycle: DEFAULT_CYCLE,
            stable: 0,
            pinned: false,
        }
    }
}

impl CycleTuner {
    /// Current budget
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Pins the budget, disabling auto-tuning
    pub fn pin(&mut self, cycle: u32) {
        self.cycle = cycle.clamp(MIN_CYCLE, MAX_CYCLE);
        self.pinned = true;
    }

    /// Feeds one framerate observation
    pub fn observe(&mut self, fps: f64) {
        if self.pinned {
            return;
        }
        if self.stable > 0 {
            self.stable -= 1;
            return;
        }
        if fps > FPS_HIGH && self.cycle < MAX_CYCLE {
            self.cycle = (self.cycle.saturating_mul(2)).min(MAX_CYCLE);
            self.stable = STABLE_WINDOW;
        } else if fps < FPS_LOW && self.cycle > MIN_CYCLE {
            self.cycle = (self.cycle / 2).max(MIN_CYCLE);
            self.stable = STABLE_WINDOW;
        }
    }
}

/// The character-cell display and input line editor
#[derive(Debug)]
pub struct Console {
    rows: usize,
    cols: usize,
    chars: Vec<u8>,
    bg: Vec<u32>,
    fg: Vec<u32>,
    cursor_x: usize,
    cursor_y: usize,
    mark: usize,
    color_bg: u32,
    color_fg: u32,
    bg_stack: Vec<u32>,
    fg_stack: Vec<u32>,
    escape: EscapeState,
    input_active: bool,
    line: Vec<u8>,
    committed: std::collections::VecDeque<u8>,
    tuner: CycleTuner,
}

impl Default for Console {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}

impl Console {
    /// Creates a cleared grid
    pub fn new(rows: usize, cols: usize) -> Self {
        Console {
            rows,
            cols,
            chars: vec![0; rows * cols],
            bg: vec![DEFAULT_BG; rows * cols],
            fg: vec![DEFAULT_FG; rows * cols],
            cursor_x: 0,
            cursor_y: 0,
            mark: 0,
            color_bg: DEFAULT_BG,
            color_fg: DEFAULT_FG,
            bg_stack: Vec::new(),
            fg_stack: Vec::new(),
            escape: EscapeState::Idle,
            input_active: false,
            line: Vec::new(),
            committed: std::collections::VecDeque::new(),
            tuner: CycleTuner::default(),
        }
    }

    /// Grid height
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Grid width
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Character at a cell (0 for empty)
    pub fn char_at(&self, row: usize, col: usize) -> u8 {
        self.chars[row * self.cols + col]
    }

    /// Foreground color of a cell
    pub fn fg_at(&self, row: usize, col: usize) -> u32 {
        self.fg[row * self.cols + col]
    }

    /// Background color of a cell
    pub fn bg_at(&self, row: usize, col: usize) -> u32 {
        self.bg[row * self.cols + col]
    }

    /// Cursor position as (row, col)
    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor_y, self.cursor_x)
    }

    /// Current foreground color
    pub fn color_fg(&self) -> u32 {
        self.color_fg
    }

    /// Current background color
    pub fn color_bg(&self) -> u32 {
        self.color_bg
    }

    /// One row as text with trailing blanks trimmed
    pub fn row_text(&self, row: usize) -> String {
        let line: String = (0..self.cols)
            .map(|c| {
                let ch = self.char_at(row, c);
                if ch == 0 {
                    ' '
                } else {
                    ch as char
                }
            })
            .collect();
        line.trim_end().to_string()
    }

    /// The whole screen as text with trailing blank lines trimmed
    pub fn screen_text(&self) -> String {
        let mut lines: Vec<String> = (0..self.rows).map(|r| self.row_text(r)).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    /// The auto-tuner
    pub fn tuner(&self) -> &CycleTuner {
        &self.tuner
    }

    /// The auto-tuner, mutably
    pub fn tuner_mut(&mut self) -> &mut CycleTuner {
        &mut self.tuner
    }

    /// Resizes and clears the grid
    pub fn resize(&mut self, rows: usize, cols: usize) {
        let rows = rows.clamp(4, 256);
        let cols = cols.clamp(8, 512);
        self.rows = rows;
        self.cols = cols;
        self.chars = vec![0; rows * cols];
        self.bg = vec![self.color_bg; rows * cols];
        self.fg = vec![self.color_fg; rows * cols];
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.mark = 0;
    }

    // -------------------------------------------------------------------
    // Output
    // -------------------------------------------------------------------

    /// Writes one output byte, the canonical path for all guest output
    pub fn put_byte(&mut self, c: u8) {
        match std::mem::replace(&mut self.escape, EscapeState::Idle) {
            EscapeState::Idle => {
                if c == 0x1b {
                    self.escape = EscapeState::Begin;
                } else {
                    self.put_plain(c);
                }
            }
            EscapeState::Begin => match c {
                b'B' | b'F' | b'S' => {
                    self.escape = EscapeState::Body {
                        cmd: c,
                        buf: String::new(),
                    };
                }
                0x1b => {}
                // unknown command: drop the rest of the sequence
                _ => self.escape = EscapeState::Skip,
            },
            EscapeState::Body { cmd, mut buf } => {
                if c == 0x1b {
                    self.apply_escape(cmd, &buf);
                } else if buf.len() < 8 && c.is_ascii_hexdigit() {
                    buf.push(c as char);
                    self.escape = EscapeState::Body { cmd, buf };
                } else {
                    // overlong or non-hex payload: drop the sequence
                    self.escape = EscapeState::Skip;
                }
            }
            EscapeState::Skip => {
                if c != 0x1b {
                    self.escape = EscapeState::Skip;
                }
            }
        }
    }

    /// Writes a whole string through the byte path
    pub fn put_str(&mut self, s: &str) {
        for b in s.bytes() {
            self.put_byte(b);
        }
    }

    fn apply_escape(&mut self, cmd: u8, payload: &str) {
        match cmd {
            b'B' => {
                if let Ok(v) = u32::from_str_radix(payload, 16) {
                    self.color_bg = v;
                }
            }
            b'F' => {
                if let Ok(v) = u32::from_str_radix(payload, 16) {
                    self.color_fg = v;
                }
            }
            b'S' => match payload {
                "1" => self.bg_stack.push(self.color_bg),
                "2" => self.fg_stack.push(self.color_fg),
                "3" => {
                    if let Some(v) = self.bg_stack.pop() {
                        self.color_bg = v;
                    }
                }
                "4" => {
                    if let Some(v) = self.fg_stack.pop() {
                        self.color_fg = v;
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// Pushes the current background color
    pub fn save_bg(&mut self) {
        self.bg_stack.push(self.color_bg);
    }

    /// Pushes the current foreground color
    pub fn save_fg(&mut self) {
        self.fg_stack.push(self.color_fg);
    }

    /// Pops the background color stack
    pub fn restore_bg(&mut self) {
        if let Some(v) = self.bg_stack.pop() {
            self.color_bg = v;
        }
    }

    /// Pops the foreground color stack
    pub fn restore_fg(&mut self) {
        if let Some(v) = self.fg_stack.pop() {
            self.color_fg = v;
        }
    }

    /// Sets the foreground color directly (the color syscalls land here)
    pub fn set_fg(&mut self, color: u32) {
        self.color_fg = color;
    }

    /// Sets the background color directly
    pub fn set_bg(&mut self, color: u32) {
        self.color_bg = color;
    }

    fn put_plain(&mut self, c: u8) {
        match c {
            b'\n' => self.newline(),
            b'\r' => self.cursor_x = 0,
            0x08 => self.backspace(),
            0x0C => {
                self.chars.fill(0);
                self.bg.fill(self.color_bg);
                self.fg.fill(self.color_fg);
                self.cursor_x = 0;
                self.cursor_y = 0;
                self.mark = 0;
            }
            0x20..=0x7E => {
                self.draw(c);
                self.advance();
            }
            // other control bytes are dropped
            _ => {}
        }
    }

    fn draw(&mut self, c: u8) {
        let idx = self.cursor_y * self.cols + self.cursor_x;
        self.chars[idx] = c;
        self.bg[idx] = self.color_bg;
        self.fg[idx] = self.color_fg;
    }

    fn advance(&mut self) {
        self.cursor_x += 1;
        if self.cursor_x == self.cols {
            self.newline();
        }
    }

    fn newline(&mut self) {
        self.cursor_x = 0;
        if self.cursor_y + 1 == self.rows {
            self.scroll();
        } else {
            self.cursor_y += 1;
        }
    }

    fn scroll(&mut self) {
        let w = self.cols;
        self.chars.copy_within(w.., 0);
        self.bg.copy_within(w.., 0);
        self.fg.copy_within(w.., 0);
        let tail = (self.rows - 1) * w;
        self.chars[tail..].fill(0);
        self.bg[tail..].fill(self.color_bg);
        self.fg[tail..].fill(self.color_fg);
        self.mark = self.mark.saturating_sub(w);
    }

    /// Backspace never erases past the input mark
    fn backspace(&mut self) {
        let pos = self.cursor_y * self.cols + self.cursor_x;
        if pos <= self.mark || pos == 0 {
            return;
        }
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else {
            self.cursor_y -= 1;
            self.cursor_x = self.cols - 1;
        }
        self.draw(0);
    }

    // -------------------------------------------------------------------
    // Line input
    // -------------------------------------------------------------------

    /// Enters line-input mode and marks the cursor position
    pub fn begin_input(&mut self) {
        self.input_active = true;
        self.mark = self.cursor_y * self.cols + self.cursor_x;
        self.line.clear();
    }

    /// Leaves line-input mode, discarding an unfinished line
    pub fn end_input(&mut self) {
        self.input_active = false;
        self.line.clear();
    }

    /// True while a reader waits for a line
    pub fn input_active(&self) -> bool {
        self.input_active
    }

    /// Feeds one key event from the host
    pub fn key(&mut self, c: u8) -> KeyEvent {
        if c == 0x03 {
            return KeyEvent::Interrupt;
        }
        if !self.input_active {
            return KeyEvent::Consumed;
        }
        match c {
            // commit keys: carriage return, EOT, SUB
            b'\r' | b'\n' | 0x04 | 0x1A => {
                self.committed.extend(self.line.drain(..));
                self.input_active = false;
                self.put_byte(b'\n');
                KeyEvent::Committed
            }
            0x08 | 0x7F => {
                if self.line.pop().is_some() {
                    self.put_byte(0x08);
                }
                KeyEvent::Consumed
            }
            0x20..=0x7E => {
                self.line.push(c);
                self.put_byte(c);
                KeyEvent::Consumed
            }
            _ => KeyEvent::Consumed,
        }
    }

    /// True when committed bytes wait to be read
    pub fn has_pending_input(&self) -> bool {
        !self.committed.is_empty()
    }

    /// Takes the next committed byte
    pub fn next_input_byte(&mut self) -> Option<u8> {
        self.committed.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_and_cursor() {
        let mut con = Console::new(4, 10);
        con.put_str("ok");
        assert_eq!(con.row_text(0), "ok");
        assert_eq!(con.cursor(), (0, 2));
    }

    #[test]
    fn test_newline_and_wrap() {
        let mut con = Console::new(4, 4);
        con.put_str("abcdef");
        assert_eq!(con.row_text(0), "abcd");
        assert_eq!(con.row_text(1), "ef");
    }

    #[test]
    fn test_scroll_at_bottom() {
        let mut con = Console::new(2, 4);
        con.put_str("aa\nbb\ncc");
        assert_eq!(con.row_text(0), "bb");
        assert_eq!(con.row_text(1), "cc");
    }

    #[test]
    fn test_carriage_return_overwrites() {
        let mut con = Console::new(2, 8);
        con.put_str("1234\rab");
        assert_eq!(con.row_text(0), "ab34");
    }

    #[test]
    fn test_clear_screen() {
        let mut con = Console::new(2, 8);
        con.put_str("junk");
        con.put_byte(0x0C);
        assert_eq!(con.screen_text(), "");
        assert_eq!(con.cursor(), (0, 0));
    }

    #[test]
    fn test_escape_sets_foreground() {
        let mut con = Console::new(2, 8);
        con.put_str("\x1bFFF112233\x1b");
        con.put_byte(b'x');
        assert_eq!(con.color_fg(), 0xFF11_2233);
        assert_eq!(con.fg_at(0, 0), 0xFF11_2233);
        // no stray characters painted by the sequence
        assert_eq!(con.row_text(0), "x");
    }

    #[test]
    fn test_escape_color_stacks() {
        let mut con = Console::new(2, 8);
        let initial = con.color_fg();
        con.put_str("\x1bS2\x1b"); // push fg
        con.put_str("\x1bFFF00FF00\x1b");
        assert_eq!(con.color_fg(), 0xFF00_FF00);
        con.put_str("\x1bS4\x1b"); // pop fg
        assert_eq!(con.color_fg(), initial);
    }

    #[test]
    fn test_malformed_escape_dropped() {
        let mut con = Console::new(2, 16);
        con.put_str("\x1bQ12\x1b");
        con.put_str("\x1bFzz\x1b");
        con.put_str("ok");
        assert_eq!(con.row_text(0), "ok");
    }

    #[test]
    fn test_line_input_commit() {
        let mut con = Console::new(2, 16);
        con.put_str("> ");
        con.begin_input();
        for &k in b"hi" {
            assert_eq!(con.key(k), KeyEvent::Consumed);
        }
        assert_eq!(con.key(b'\r'), KeyEvent::Committed);
        assert!(con.has_pending_input());
        assert_eq!(con.next_input_byte(), Some(b'h'));
        assert_eq!(con.next_input_byte(), Some(b'i'));
        assert_eq!(con.next_input_byte(), None);
    }

    #[test]
    fn test_backspace_stops_at_mark() {
        let mut con = Console::new(2, 16);
        con.put_str("> ");
        con.begin_input();
        con.key(b'a');
        con.key(0x08);
        con.key(0x08); // nothing left to erase
        assert_eq!(con.row_text(0), ">");
        // the prompt survives
        assert_eq!(con.char_at(0, 0), b'>');
    }

    #[test]
    fn test_ctrl_c_reports_interrupt() {
        let mut con = Console::new(2, 8);
        assert_eq!(con.key(0x03), KeyEvent::Interrupt);
    }

    #[test]
    fn test_tuner_doubles_and_halves() {
        let mut tuner = CycleTuner::default();
        let start = tuner.cycle();
        tuner.observe(60.0);
        assert_eq!(tuner.cycle(), start * 2);
        // held stable for the window
        tuner.observe(60.0);
        assert_eq!(tuner.cycle(), start * 2);
        for _ in 0..STABLE_WINDOW {
            tuner.observe(40.0);
        }
        tuner.observe(10.0);
        assert_eq!(tuner.cycle(), start);
    }

    #[test]
    fn test_tuner_pin_overrides() {
        let mut tuner = CycleTuner::default();
        tuner.pin(5000);
        tuner.observe(60.0);
        assert_eq!(tuner.cycle(), 5000);
    }
}
