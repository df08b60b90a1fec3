//! Paginated machine log retrieval.

use crate::error::{Error, Result};
use crate::objects::Machine;
use regex::Regex;
use tracing::debug;

/// Default chunk size for reads.
pub const DEFAULT_CHUNK_SIZE: u64 = 4096;

/// Chunk size used when scanning whole logs.
pub const SEARCH_CHUNK_SIZE: u64 = 512 * 1024;

/// Iterator over the chunks of one machine log.
///
/// Reads start at offset 0, advance by the length of each chunk and stop at
/// the first empty chunk. A failed read is yielded once and ends iteration.
pub struct LogReader<'a> {
    machine: &'a Machine,
    index: u32,
    chunk_size: u64,
    offset: u64,
    done: bool,
}

impl<'a> LogReader<'a> {
    pub fn new(machine: &'a Machine, index: u32, chunk_size: u64) -> Self {
        Self {
            machine,
            index,
            chunk_size: chunk_size.max(1),
            offset: 0,
            done: false,
        }
    }

    /// Bytes read so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Concatenate all remaining chunks.
    pub fn read_all(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in self {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl Iterator for LogReader<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.machine.read_log(self.index, self.offset, self.chunk_size) {
            Ok(chunk) if chunk.is_empty() => {
                debug!(index = self.index, total = self.offset, "end of log");
                self.done = true;
                None
            }
            Ok(chunk) => {
                self.offset += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A log line matching a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMatch {
    /// 1-based line number.
    pub line_number: usize,
    pub line: String,
}

/// Lines of log `index` matching `pattern`.
///
/// Lines split across chunk boundaries are reassembled before matching.
pub fn find_in_log(
    machine: &Machine,
    index: u32,
    pattern: &str,
    chunk_size: u64,
) -> Result<Vec<LogMatch>> {
    let re = Regex::new(pattern)
        .map_err(|e| Error::Config(format!("invalid pattern '{}': {}", pattern, e)))?;

    let mut matches = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut line_number = 0;
    let mut check = |bytes: &[u8], matches: &mut Vec<LogMatch>| {
        line_number += 1;
        let line = String::from_utf8_lossy(bytes);
        let line = line.trim_end_matches('\r');
        if re.is_match(line) {
            matches.push(LogMatch {
                line_number,
                line: line.to_string(),
            });
        }
    };

    for chunk in LogReader::new(machine, index, chunk_size) {
        pending.extend_from_slice(&chunk?);
        let mut start = 0;
        while let Some(pos) = pending[start..].iter().position(|b| *b == b'\n') {
            check(&pending[start..start + pos], &mut matches);
            start += pos + 1;
        }
        pending.drain(..start);
    }
    if !pending.is_empty() {
        check(&pending, &mut matches);
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Credentials, SessionManager};
    use crate::transport::testing::RecordingTransport;
    use crate::transport::{InProcessTransport, Transport};
    use std::sync::Arc;
    use vboxctl_sim::{MachineSpec, Platform, SimConfig};

    fn setup() -> (Arc<Platform>, Arc<RecordingTransport>, SessionManager) {
        let platform = Arc::new(Platform::new(
            SimConfig::default().with_machine(MachineSpec::new("noisy", "Debian_64").with_log_lines(300)),
        ));
        let inner: Arc<dyn Transport> = Arc::new(InProcessTransport::new(platform.clone()));
        let recorder = Arc::new(RecordingTransport::new(inner));
        (platform, recorder.clone(), SessionManager::new(recorder))
    }

    #[test]
    fn test_pagination_steps_and_bytes() {
        let (platform, recorder, mut mgr) = setup();
        let session = mgr.connect(&Credentials::default()).unwrap();
        let machine = session.machine_by_name("noisy").unwrap();
        let expected = platform.log_contents("noisy", 0).unwrap();

        for size in [1000u64, 4096, expected.len() as u64, expected.len() as u64 + 1] {
            let before = recorder.count("read_log");
            let chunks: Vec<Vec<u8>> = LogReader::new(&machine, 0, size)
                .collect::<Result<_>>()
                .unwrap();

            let total = expected.len() as u64;
            assert_eq!(chunks.len() as u64, total.div_ceil(size));
            // One extra read returns the empty terminating chunk.
            assert_eq!(recorder.count("read_log") - before, chunks.len() + 1);
            assert_eq!(chunks.concat(), expected);
        }
    }

    #[test]
    fn test_read_all_second_log() {
        let (platform, _recorder, mut mgr) = setup();
        let session = mgr.connect(&Credentials::default()).unwrap();
        let machine = session.machine_by_name("noisy").unwrap();

        let log = LogReader::new(&machine, 1, 7).read_all().unwrap();
        assert_eq!(log, platform.log_contents("noisy", 1).unwrap());
        assert_eq!(machine.log_filename(1).unwrap(), "VBox.log.1");
    }

    #[test]
    fn test_bad_index_ends_iteration() {
        let (_platform, _recorder, mut mgr) = setup();
        let session = mgr.connect(&Credentials::default()).unwrap();
        let machine = session.machine_by_name("noisy").unwrap();

        let mut reader = LogReader::new(&machine, 9, 100);
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_find_across_chunk_boundaries() {
        let (_platform, _recorder, mut mgr) = setup();
        let session = mgr.connect(&Credentials::default()).unwrap();
        let machine = session.machine_by_name("noisy").unwrap();

        // Tiny chunks split nearly every line.
        let small = find_in_log(&machine, 0, r"LUN#1\d\d/", 13).unwrap();
        let large = find_in_log(&machine, 0, r"LUN#1\d\d/", SEARCH_CHUNK_SIZE).unwrap();
        assert_eq!(small.len(), 100);
        assert_eq!(small, large);
        assert!(small[0].line.ends_with("CFGM: /Devices/ahci/0/LUN#100/Config ok"));

        let named = find_in_log(&machine, 0, "^.* Machine name: noisy$", 13).unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].line_number, 2);
    }

    #[test]
    fn test_find_rejects_bad_pattern() {
        let (_platform, _recorder, mut mgr) = setup();
        let session = mgr.connect(&Credentials::default()).unwrap();
        let machine = session.machine_by_name("noisy").unwrap();
        assert!(matches!(
            find_in_log(&machine, 0, "(unclosed", 100),
            Err(Error::Config(_))
        ));
    }
}
