//! 📊 progress.rs — "Are we there yet?" — every pipeline, every time, forever.
//!
//! 🚀 This module answers the age-old question: "how many films have moved, and how fast?"
//! With cold hard numbers, a progress bar, and a table so comfy it has lumbar support.
//!
//! The bar's length is the source film count. A film counts as done once its
//! batch is committed, whether it was loaded, skipped as malformed, or refused
//! by the target, so the bar always ends at 100% on a completed run.
//!
//! ⚠️  Warning: Watching this progress bar will not make it go faster.
//! Neither will refreshing it. We've tried. Science says no.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

// -- 📏 one mebibyte — not a megabyte, pedants. there's a difference and I will die on this hill.
const MIB: u64 = 1024 * 1024;

/// 📦 Converts raw bytes into a human-readable string.
/// Because "1073741824 bytes" is a war crime in a UI.
fn format_bytes(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        // -- 🐛 raw bytes mode. small payloads need love too.
        format!("{} bytes", bytes)
    }
}

/// 🔢 Formats a number with commas for the 3 people in the audience who like readability.
/// "1000000 films" → "1,000,000 films" — you're welcome, eyes.
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ Formats a Duration into MM:SS or HH:MM:SS.
/// If it shows HH:MM:SS, you should probably call your mom. It's been a while.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 📡 A snapshot of throughput at any given moment.
struct Rates {
    films_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Tracks committed films and bulk bytes, and paints them onto an indicatif bar.
///
/// Uses a sliding 5-second window for rate calculations so spikes don't scare you.
pub(crate) struct ProgressMetrics {
    /// 🏷️ what are we even migrating? a name to display in the UI
    label: String,
    /// 📏 films in the source. 0 means "no idea", and the ETA shrugs.
    total_films: u64,
    /// 🎬 films already accounted for, including the ones a previous run committed
    films_done: u64,
    /// 📦 uncompressed bulk bytes shipped this run
    bytes_sent: u64,
    progress_bar: ProgressBar,
    /// 🔄 sliding window of (timestamp, bytes, films) for rate calculation
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ProgressMetrics")
            .field("label", &self.label)
            .field("total_films", &self.total_films)
            .field("films_done", &self.films_done)
            .field("bytes_sent", &self.bytes_sent)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 A bar of `total_films`, already advanced by `already_done` (a resumed run).
    pub(crate) fn new(label: String, total_films: u64, already_done: u64) -> Self {
        let progress_bar = ProgressBar::new(total_films);
        // -- 🎨 cyan because it's classy, blue because it's calm. if the template
        // -- ever fails to parse we fall back to indicatif's default and keep going.
        let style = match ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
            Ok(style) => style.progress_chars("=>-"),
            Err(_) => ProgressStyle::default_bar(),
        };
        progress_bar.set_style(style);
        progress_bar.set_position(already_done.min(total_films));

        let start_time = Instant::now();
        // -- 🔄 seed the rate window so we don't divide by zero like animals
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64, already_done));

        Self {
            label,
            total_films,
            films_done: already_done,
            bytes_sent: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 A batch was committed: `bytes` of bulk body, `films` accounted for.
    pub(crate) fn update(&mut self, bytes: u64, films: u64) {
        self.bytes_sent += bytes;
        self.films_done += films;

        let rates = self.calculate_rates();
        self.render(rates);
        self.progress_bar.set_position(self.films_done.min(self.total_films));
    }

    /// ✅ Ring the bell. Or we got interrupted. Same bar, different mood.
    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    fn calculate_rates(&mut self) -> Rates {
        let now = Instant::now();
        let window = Duration::from_secs(5);
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > window {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, self.bytes_sent, self.films_done));

        if let Some(&(oldest_time, oldest_bytes, oldest_films)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest_time).as_secs_f64();
            if elapsed > 0.0 {
                let bytes_delta = self.bytes_sent.saturating_sub(oldest_bytes);
                let films_delta = self.films_done.saturating_sub(oldest_films);
                return Rates {
                    films_per_sec: films_delta as f64 / elapsed,
                    mib_per_sec: (bytes_delta as f64 / elapsed) / MIB as f64,
                };
            }
        }

        // -- 💤 not enough elapsed time yet — zeros, and maintain composure
        Rates {
            films_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    /// 🎨 Layout:
    /// ```text
    /// migrating: <label>
    ///   <films/s>    <done / total films>
    ///   <MiB/s>      <bytes sent>
    ///   <elapsed>    <remaining>
    /// | [=====>----------]
    /// ```
    fn render(&self, rates: Rates) {
        let fraction = if self.total_films > 0 {
            (self.films_done as f64 / self.total_films as f64).min(1.0)
        } else {
            0.0
        };

        let elapsed = self.start_time.elapsed();
        let remaining = if fraction > 0.0 && fraction < 1.0 {
            // 🔮 linear extrapolation — assumes the future looks like the past
            let total_estimated = elapsed.as_secs_f64() / fraction;
            format_duration(Duration::from_secs_f64(total_estimated - elapsed.as_secs_f64()))
        } else {
            "--:--".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Films/s", format_number(rates.films_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!(
                "{} / {} Films ({:.2}%)",
                format_number(self.films_done),
                format_number(self.total_films),
                fraction * 100.0
            ))
            .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", rates.mib_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} sent", format_bytes(self.bytes_sent))).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} remaining", remaining)).set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("migrating: {}\n{}", self.label, table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn the_one_where_long_runs_grow_an_hours_column() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn the_one_where_bytes_pick_their_own_units() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * MIB), "3.00 MiB");
    }

    #[test]
    fn the_one_where_a_resumed_bar_starts_partway() {
        let mut metrics = ProgressMetrics::new("movies".into(), 10, 4);
        metrics.update(100, 3);
        assert_eq!(metrics.films_done, 7);
        assert_eq!(metrics.bytes_sent, 100);
        assert_eq!(metrics.progress_bar.position(), 7);
        metrics.finish();
    }
}
