//! Replication coordinates
//!
//! Two flavors of position in the source's change stream:
//!
//! - [`BinlogCoordinates`] — a *starting* coordinate: the GTID set executed
//!   so far plus a binlog file/offset. Fixes where streaming begins.
//! - [`TransactionCoordinates`] — a *current* coordinate: adds the active
//!   transaction's server id + sequence number, for live progress reporting.
//!
//! [`GtidSet`] is the replication-set identifier algebra: parsing,
//! formatting, and the set-subtraction used when a run is started from an
//! explicit GTID start point.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{ExtractError, Result};

/// Separator used when a file/offset position is flattened into a single
/// coordination-store value. A multi-character private token, so file names
/// containing path separators cannot collide with it.
pub(crate) const FILE_POS_SEPARATOR: &str = "//syphon//";

// ============================================================================
// GTID sets
// ============================================================================

/// Inclusive interval of sequence numbers within one replication set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    fn parse(s: &str) -> Result<Self> {
        let parse_num = |n: &str| {
            n.parse::<i64>()
                .map_err(|_| ExtractError::replication(format!("invalid GTID interval: {s}")))
        };
        let iv = match s.split_once('-') {
            Some((a, b)) => Interval {
                start: parse_num(a)?,
                end: parse_num(b)?,
            },
            None => {
                let n = parse_num(s)?;
                Interval { start: n, end: n }
            }
        };
        if iv.start < 1 || iv.end < iv.start {
            return Err(ExtractError::replication(format!(
                "invalid GTID interval: {s}"
            )));
        }
        Ok(iv)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A set of executed transactions, keyed by originating server id.
///
/// Textual form is the MySQL GTID-set syntax:
/// `3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:8,859f2f58-...:1-3`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, Vec<Interval>>,
}

impl GtidSet {
    /// Parse the textual GTID-set form. Empty input yields an empty set.
    pub fn parse(s: &str) -> Result<Self> {
        let mut sets = BTreeMap::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut pieces = part.split(':');
            let sid = pieces
                .next()
                .and_then(|p| Uuid::from_str(p).ok())
                .ok_or_else(|| {
                    ExtractError::replication(format!("invalid GTID set element: {part}"))
                })?;
            let mut intervals = Vec::new();
            for piece in pieces {
                intervals.push(Interval::parse(piece)?);
            }
            if intervals.is_empty() {
                return Err(ExtractError::replication(format!(
                    "GTID set element has no intervals: {part}"
                )));
            }
            let entry: &mut Vec<Interval> = sets.entry(sid).or_default();
            entry.extend(intervals);
            normalize(entry);
        }
        Ok(Self { sets })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// True if `gno` of server `sid` is contained in this set.
    pub fn contains(&self, sid: Uuid, gno: i64) -> bool {
        self.sets
            .get(&sid)
            .is_some_and(|ivs| ivs.iter().any(|iv| iv.start <= gno && gno <= iv.end))
    }

    /// Record one executed transaction.
    pub fn add(&mut self, sid: Uuid, gno: i64) {
        let entry = self.sets.entry(sid).or_default();
        entry.push(Interval {
            start: gno,
            end: gno,
        });
        normalize(entry);
    }

    /// Set subtraction: everything in `self` not contained in `other`.
    ///
    /// Used by the explicit-start-point plan branch: the difference between
    /// the server's executed set and the requested start point is the set the
    /// restarted stream must skip.
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut out = BTreeMap::new();
        for (sid, intervals) in &self.sets {
            let remaining = match other.sets.get(sid) {
                None => intervals.clone(),
                Some(minus) => subtract_intervals(intervals, minus),
            };
            if !remaining.is_empty() {
                out.insert(*sid, remaining);
            }
        }
        GtidSet { sets: out }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (sid, intervals) in &self.sets {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{sid}")?;
            for iv in intervals {
                write!(f, ":{iv}")?;
            }
        }
        Ok(())
    }
}

/// Sort, merge overlapping and adjacent intervals.
fn normalize(intervals: &mut Vec<Interval>) {
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end + 1 => last.end = last.end.max(iv.end),
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}

fn subtract_intervals(from: &[Interval], minus: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    for iv in from {
        let mut pieces = vec![*iv];
        for m in minus {
            let mut next = Vec::new();
            for p in pieces {
                if m.end < p.start || m.start > p.end {
                    next.push(p);
                    continue;
                }
                if m.start > p.start {
                    next.push(Interval {
                        start: p.start,
                        end: m.start - 1,
                    });
                }
                if m.end < p.end {
                    next.push(Interval {
                        start: m.end + 1,
                        end: p.end,
                    });
                }
            }
            pieces = next;
        }
        out.extend(pieces);
    }
    out
}

// ============================================================================
// Coordinates
// ============================================================================

/// Starting coordinate: where streaming begins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    /// Executed GTID set at this position (textual form, may be empty)
    pub gtid_set: String,
    /// Binlog file name
    pub log_file: String,
    /// Byte offset within the file
    pub log_pos: u32,
}

impl BinlogCoordinates {
    pub fn is_empty(&self) -> bool {
        self.gtid_set.is_empty() && self.log_file.is_empty()
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} [{}]", self.log_file, self.log_pos, self.gtid_set)
    }
}

/// Current coordinate: the active transaction's position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCoordinates {
    /// Binlog file the transaction was read from
    pub log_file: String,
    /// Byte offset of the transaction's last event
    pub log_pos: u32,
    /// Originating server id of the transaction
    pub sid: Uuid,
    /// Sequence number within that server's set
    pub gno: i64,
}

impl TransactionCoordinates {
    pub fn new(log_file: impl Into<String>, log_pos: u32, sid: Uuid, gno: i64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            sid,
            gno,
        }
    }

    /// Stats-surface form of this coordinate.
    pub fn as_current(&self) -> CurrentCoordinates {
        CurrentCoordinates::new(self.log_file.clone(), self.log_pos, self.sid, self.gno)
    }
}

/// Current coordinate with the owning file name, as surfaced in statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentCoordinates {
    pub file: String,
    pub position: u32,
    /// `sid:gno` of the active transaction, empty before streaming starts
    pub gtid: String,
}

impl CurrentCoordinates {
    pub fn new(file: impl Into<String>, position: u32, sid: Uuid, gno: i64) -> Self {
        Self {
            file: file.into(),
            position,
            gtid: format!("{sid}:{gno}"),
        }
    }

    /// Within one replication-set stream sequence numbers never go backwards.
    pub fn is_ordered_after(&self, earlier: &CurrentCoordinates) -> bool {
        match (split_gno(&self.gtid), split_gno(&earlier.gtid)) {
            (Some((sa, ga)), Some((sb, gb))) if sa == sb => ga >= gb,
            _ => true,
        }
    }
}

fn split_gno(gtid: &str) -> Option<(&str, i64)> {
    let (sid, gno) = gtid.rsplit_once(':')?;
    Some((sid, gno.parse().ok()?))
}

// ============================================================================
// File/offset position and its store codec
// ============================================================================

/// A binlog file/offset pair, the zero value meaning "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePosition {
    pub file: String,
    pub pos: u32,
}

impl FilePosition {
    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
    }
}

/// Flatten a file/offset pair into a single store value.
pub fn encode_file_pos(file: &str, pos: u32) -> String {
    format!("{file}{FILE_POS_SEPARATOR}{pos}")
}

/// Inverse of [`encode_file_pos`].
pub fn parse_file_pos(value: &str) -> Result<FilePosition> {
    let mut parts = value.split(FILE_POS_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(file), Some(pos), None) => Ok(FilePosition {
            file: file.to_string(),
            pos: pos.parse().map_err(|_| {
                ExtractError::other(format!("unexpected file/offset value: {value}"))
            })?,
        }),
        _ => Err(ExtractError::other(format!(
            "unexpected file/offset value: {value}"
        ))),
    }
}
