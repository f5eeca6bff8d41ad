//! In-memory color index over the fingerprint store.
//!
//! Built once after scanning from the store's full record snapshot. Two
//! structures: a dense `2^24`-cell count table (exact color → number of
//! tiles with that exact average color, not a statistical bucket), and
//! the record list itself in lexicographic path order for nearest-color
//! scans.
//!
//! Nearest-color lookup is a brute-force linear scan. Library sizes in
//! scope are a few thousand tiles, and the match cache means each
//! distinct source color pays for one scan per run; determinism matters
//! more than asymptotics here.

use crate::error::{Error, Result};
use crate::imaging::Rgb;
use crate::store::TileRecord;

/// The 16 fixed reference colors used to group tile averages for the
/// post-scan diagnostics report. Reporting only — matching never looks
/// at these.
pub const NAMED_COLORS: [(&str, Rgb); 16] = [
    ("Black", (0, 0, 0)),
    ("White", (255, 255, 255)),
    ("Red", (255, 0, 0)),
    ("Lime", (0, 255, 0)),
    ("Blue", (0, 0, 255)),
    ("Yellow", (255, 255, 0)),
    ("Cyan", (0, 255, 255)),
    ("Magenta", (255, 0, 255)),
    ("Silver", (192, 192, 192)),
    ("Gray", (128, 128, 128)),
    ("Maroon", (128, 0, 0)),
    ("Olive", (128, 128, 0)),
    ("Green", (0, 128, 0)),
    ("Purple", (128, 0, 128)),
    ("Teal", (0, 128, 128)),
    ("Navy", (0, 0, 128)),
];

/// Euclidean distance between two exact RGB colors.
pub fn color_distance(a: Rgb, b: Rgb) -> f64 {
    let dr = a.0 as f64 - b.0 as f64;
    let dg = a.1 as f64 - b.1 as f64;
    let db = a.2 as f64 - b.2 as f64;
    (dr * dr + dg * dg + db * db).sqrt()
}

fn cell(color: Rgb) -> usize {
    ((color.0 as usize) << 16) | ((color.1 as usize) << 8) | color.2 as usize
}

pub struct ColorIndex {
    /// Records in lexicographic path order — the tie-break order for
    /// equidistant distinct colors.
    records: Vec<TileRecord>,
    /// Exact color → tile count, one cell per possible RGB triple.
    counts: Vec<u32>,
}

impl ColorIndex {
    /// Build from the store snapshot. An empty library is fatal: there is
    /// nothing to compose with.
    pub fn build(records: Vec<TileRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::EmptyLibrary);
        }
        let mut counts = vec![0u32; 1 << 24];
        for record in &records {
            counts[cell(record.color())] += 1;
        }
        Ok(Self { records, counts })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of tiles whose average color is exactly `color`.
    pub fn count(&self, color: Rgb) -> u32 {
        self.counts[cell(color)]
    }

    /// The closest exact average color to `color`, as the distance plus
    /// every tile path sharing that exact color.
    ///
    /// Ties in distance between *distinct* colors resolve to the first
    /// color found in the scan, i.e. the lexicographically smallest path;
    /// further records with the winning exact color keep accumulating.
    /// The result is never empty (the index rejects empty libraries).
    pub fn nearest(&self, color: Rgb) -> (f64, Vec<&str>) {
        let mut best_distance = f64::INFINITY;
        let mut best_color: Option<Rgb> = None;
        let mut paths: Vec<&str> = Vec::new();

        for record in &self.records {
            let candidate = record.color();
            if Some(candidate) == best_color {
                paths.push(&record.path);
                continue;
            }
            let distance = color_distance(color, candidate);
            if distance < best_distance {
                best_distance = distance;
                best_color = Some(candidate);
                paths.clear();
                paths.push(&record.path);
            }
        }

        (best_distance, paths)
    }

    /// Log the post-scan diagnostics: how many distinct colors appear at
    /// each multiplicity, the tile totals per named reference color, and
    /// the dominant name.
    pub fn log_distribution(&self) {
        let mut frequency: std::collections::BTreeMap<u32, (u32, Rgb)> =
            std::collections::BTreeMap::new();
        let mut named_totals = [0u64; NAMED_COLORS.len()];

        for (idx, &count) in self.counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let color = ((idx >> 16) as u8, (idx >> 8) as u8, idx as u8);
            let entry = frequency.entry(count).or_insert((0, color));
            entry.0 += 1;

            let mut nearest = 0;
            let mut nearest_distance = f64::INFINITY;
            for (i, &(_, reference)) in NAMED_COLORS.iter().enumerate() {
                let d = color_distance(color, reference);
                if d < nearest_distance {
                    nearest = i;
                    nearest_distance = d;
                }
            }
            named_totals[nearest] += count as u64;
        }

        log::info!("index: {} tiles across {} distinct colors", self.records.len(), {
            frequency.values().map(|&(cells, _)| cells as u64).sum::<u64>()
        });
        for (&count, &(cells, sample)) in &frequency {
            if cells == 1 {
                let (r, g, b) = sample;
                log::info!("index: multiplicity {count} x {cells} color (r {r} g {g} b {b})");
            } else {
                log::info!("index: multiplicity {count} x {cells} colors");
            }
        }

        let mut dominant = 0;
        for (i, (name, _)) in NAMED_COLORS.iter().enumerate() {
            log::info!("index: color group {name} = {}", named_totals[i]);
            if named_totals[i] > named_totals[dominant] {
                dominant = i;
            }
        }
        log::info!(
            "index: dominant color group {} ({} tiles)",
            NAMED_COLORS[dominant].0,
            named_totals[dominant]
        );
    }
}
