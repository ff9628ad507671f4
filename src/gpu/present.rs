// SPDX-License-Identifier: GPL-3.0-only

//! Display surfaces behind `swap_buffers`
//!
//! The [`TerminalPresenter`] renders frames to the terminal using Unicode
//! half-block characters for improved vertical resolution.

use super::{GpuError, GpuResult, RgbaFrame};
use crossterm::{
    cursor::{Hide, Show},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    Terminal, backend::CrosstermBackend, buffer::Buffer, layout::Rect, style::Color,
    widgets::Widget,
};
use std::io::{self, Stdout, stdout};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// A presented back buffer: RGBA, rows top to bottom
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u8],
}

/// Receives every frame passed to `swap_buffers`
pub trait Presenter: Send {
    fn present(&mut self, frame: FrameView<'_>) -> GpuResult<()>;
}

/// Counters readable from any thread
#[derive(Debug, Default)]
pub struct PresenterStats {
    frames: AtomicU64,
    last: Mutex<Option<RgbaFrame>>,
}

impl PresenterStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Copy of the most recent frame, when the presenter keeps one
    pub fn last_frame(&self) -> Option<RgbaFrame> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

/// Presenter without a display; counts frames and keeps the last one
#[derive(Debug, Default)]
pub struct HeadlessPresenter {
    stats: Arc<PresenterStats>,
}

impl HeadlessPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<PresenterStats> {
        Arc::clone(&self.stats)
    }
}

impl Presenter for HeadlessPresenter {
    fn present(&mut self, frame: FrameView<'_>) -> GpuResult<()> {
        if let Ok(mut last) = self.stats.last.lock() {
            let kept = last.get_or_insert_with(|| RgbaFrame {
                width: frame.width,
                height: frame.height,
                pixels: Vec::new(),
            });
            kept.width = frame.width;
            kept.height = frame.height;
            kept.pixels.clear();
            kept.pixels.extend_from_slice(frame.pixels);
        }
        self.stats.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Presenter drawing into the terminal's alternate screen
pub struct TerminalPresenter {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    stats: Arc<PresenterStats>,
}

impl TerminalPresenter {
    /// Switch to the alternate screen.
    ///
    /// Raw mode stays off so Ctrl+C still reaches the signal handler.
    pub fn new() -> io::Result<Self> {
        let mut out = stdout();
        execute!(out, EnterAlternateScreen, Hide)?;
        let terminal = Terminal::new(CrosstermBackend::new(out))?;
        debug!("Terminal presenter ready");
        Ok(Self {
            terminal,
            stats: Arc::new(PresenterStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<PresenterStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for TerminalPresenter {
    fn drop(&mut self) {
        if let Err(e) = execute!(self.terminal.backend_mut(), LeaveAlternateScreen, Show) {
            warn!(error = %e, "Failed to restore terminal");
        }
    }
}

impl Presenter for TerminalPresenter {
    fn present(&mut self, frame: FrameView<'_>) -> GpuResult<()> {
        let count = self.stats.frames.fetch_add(1, Ordering::SeqCst) + 1;
        let status = format!(
            "picam | {}x{} | frame {} | Ctrl+C quit",
            frame.width, frame.height, count
        );

        self.terminal
            .draw(|f| {
                let area = f.area();

                // Reserve bottom line for status
                let frame_area = Rect {
                    x: area.x,
                    y: area.y,
                    width: area.width,
                    height: area.height.saturating_sub(1),
                };
                f.render_widget(FrameWidget { frame }, frame_area);

                let status_area = Rect {
                    x: area.x,
                    y: area.height.saturating_sub(1),
                    width: area.width,
                    height: 1,
                };
                f.render_widget(StatusBar { message: &status }, status_area);
            })
            .map_err(|e| GpuError::Present(e.to_string()))?;
        Ok(())
    }
}

/// Widget that renders a frame using half-block characters
struct FrameWidget<'a> {
    frame: FrameView<'a>,
}

impl Widget for FrameWidget<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let frame = self.frame;
        if frame.width == 0 || frame.height == 0 || area.width == 0 || area.height == 0 {
            return;
        }

        // Each terminal cell displays 2 vertical pixels using half-block characters
        let frame_aspect = frame.width as f64 / frame.height as f64;
        let term_width = area.width as f64;
        let term_height = (area.height * 2) as f64;

        let (display_width, display_height) = if term_width / term_height > frame_aspect {
            // Terminal is wider - fit to height
            let h = term_height;
            let w = h * frame_aspect;
            (w as u16, (h / 2.0) as u16)
        } else {
            // Terminal is taller - fit to width
            let w = term_width;
            let h = w / frame_aspect;
            (w as u16, (h / 2.0) as u16)
        };
        if display_width == 0 || display_height == 0 {
            return;
        }

        // Center the image
        let x_offset = area.x + (area.width.saturating_sub(display_width)) / 2;
        let y_offset = area.y + (area.height.saturating_sub(display_height)) / 2;

        let x_scale = frame.width as f64 / display_width as f64;
        let y_scale = frame.height as f64 / (display_height * 2) as f64;

        // Upper half (▀) coloured with fg, lower half with bg
        for ty in 0..display_height {
            for tx in 0..display_width {
                let term_x = x_offset + tx;
                let term_y = y_offset + ty;

                if term_x >= area.x + area.width || term_y >= area.y + area.height {
                    continue;
                }

                let src_x = (tx as f64 * x_scale) as u32;
                let src_y_top = (ty as f64 * 2.0 * y_scale) as u32;
                let src_y_bottom = ((ty as f64 * 2.0 + 1.0) * y_scale) as u32;

                if let Some(cell) = buf.cell_mut((term_x, term_y)) {
                    cell.set_char('▀');
                    cell.set_fg(sample_pixel(&frame, src_x, src_y_top));
                    cell.set_bg(sample_pixel(&frame, src_x, src_y_bottom));
                }
            }
        }
    }
}

fn sample_pixel(frame: &FrameView<'_>, x: u32, y: u32) -> Color {
    let x = x.min(frame.width - 1);
    let y = y.min(frame.height - 1);
    let idx = ((y * frame.width + x) * 4) as usize;
    match frame.pixels.get(idx..idx + 3) {
        Some(px) => Color::Rgb(px[0], px[1], px[2]),
        None => Color::Black,
    }
}

/// Status bar widget
struct StatusBar<'a> {
    message: &'a str,
}

impl Widget for StatusBar<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        for x in area.x..area.x + area.width {
            if let Some(cell) = buf.cell_mut((x, area.y)) {
                cell.set_char(' ');
                cell.set_bg(Color::DarkGray);
            }
        }

        let text: String = self.message.chars().take(area.width as usize).collect();
        buf.set_string(
            area.x,
            area.y,
            text,
            ratatui::style::Style::default()
                .fg(Color::White)
                .bg(Color::DarkGray),
        );
    }
}
