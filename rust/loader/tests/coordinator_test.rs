// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use ifc_lite_loader::analysis::STL_RECORD_SIZE;
use ifc_lite_loader::{
    analyze_file, CancellationToken, ChunkCoordinator, ChunkError, ChunkParser, ChunkStrategy,
    FileChunk, FixedSizeChunker, LoadError, StlChunkParser, WireTriangle,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn triangle(i: usize) -> WireTriangle {
    let f = i as f32;
    WireTriangle {
        normal: [0.0, 0.0, 1.0],
        vertices: [[f, 0.0, 0.0], [f + 1.0, 0.0, 0.0], [f, 1.0, f * 0.5]],
        attribute: (i % 65_536) as u16,
    }
}

fn write_stl(path: &Path, count: usize) {
    let mut file = std::fs::File::create(path).unwrap();
    let mut header = vec![0u8; 80];
    header[..4].copy_from_slice(b"test");
    header.extend_from_slice(&(count as u32).to_le_bytes());
    file.write_all(&header).unwrap();
    for i in 0..count {
        file.write_all(&triangle(i).to_stl_record()).unwrap();
    }
}

fn split(path: &Path, records_per_chunk: u64) -> Vec<FileChunk> {
    let analysis = analyze_file(path, &CancellationToken::new()).unwrap();
    FixedSizeChunker::new()
        .split(&analysis, records_per_chunk * STL_RECORD_SIZE, ChunkStrategy::FixedSize)
        .unwrap()
}

/// STL parser with per-chunk delays and optional failures.
struct ScriptedParser {
    delays: Vec<Duration>,
    fail_chunk: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedParser {
    fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            fail_chunk: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ChunkParser for ScriptedParser {
    type Record = WireTriangle;

    fn parse_chunk(&self, chunk: &FileChunk, bytes: &[u8]) -> Result<Vec<WireTriangle>, ChunkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(chunk.id) {
            thread::sleep(*delay);
        }
        if self.fail_chunk == Some(chunk.id) {
            return Err(ChunkError::Parse(format!("synthetic failure in chunk {}", chunk.id)));
        }
        StlChunkParser.parse_chunk(chunk, bytes)
    }
}

#[test]
fn test_chunked_equals_sequential_under_shuffled_completion() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mesh.stl");
    write_stl(&path, 1_000);

    let whole = split(&path, 1_000_000);
    assert_eq!(whole.len(), 1);
    let bytes = std::fs::read(&path).unwrap();
    let sequential = StlChunkParser
        .parse_chunk(&whole[0], &bytes[whole[0].byte_start as usize..])
        .unwrap();
    assert_eq!(sequential.len(), 1_000);

    let chunks = split(&path, 73);
    assert_eq!(chunks.len(), 14);

    for seed in 0..5u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let delays = (0..chunks.len())
            .map(|_| Duration::from_millis(rng.random_range(0..25)))
            .collect();
        let parser = Arc::new(ScriptedParser::new(delays));

        let mut completions = 0;
        let merged = ChunkCoordinator::new(Some(4), Duration::from_secs(10))
            .coordinate_parsing(&chunks, parser, &CancellationToken::new(), |_, _| completions += 1)
            .unwrap();

        assert_eq!(completions, chunks.len());
        assert_eq!(merged, sequential, "seed {seed}");
    }
}

#[test]
fn test_one_failed_chunk_fails_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("three.stl");
    write_stl(&path, 30);
    let chunks = split(&path, 10);
    assert_eq!(chunks.len(), 3);

    let mut parser = ScriptedParser::new(Vec::new());
    parser.fail_chunk = Some(1);
    let err = ChunkCoordinator::new(Some(3), Duration::from_secs(10))
        .coordinate_parsing(&chunks, Arc::new(parser), &CancellationToken::new(), |_, _| {})
        .unwrap_err();

    match &err {
        LoadError::ParseFailed { total, failures } => {
            assert_eq!(*total, 3);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].chunk_id, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("1 of 3 chunks failed"));
}

#[test]
fn test_slow_chunk_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.stl");
    write_stl(&path, 20);
    let chunks = split(&path, 10);

    let parser = Arc::new(ScriptedParser::new(vec![Duration::from_millis(800), Duration::ZERO]));
    let started = Instant::now();
    let err = ChunkCoordinator::new(Some(2), Duration::from_millis(100))
        .coordinate_parsing(&chunks, parser, &CancellationToken::new(), |_, _| {})
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(700));
    match err {
        LoadError::ParseFailed { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].chunk_id, 0);
            assert!(matches!(failures[0].error, ChunkError::Timeout(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_panicking_parser_is_isolated() {
    struct Explosive;
    impl ChunkParser for Explosive {
        type Record = WireTriangle;
        fn parse_chunk(&self, chunk: &FileChunk, bytes: &[u8]) -> Result<Vec<WireTriangle>, ChunkError> {
            if chunk.id == 2 {
                panic!("corrupt record in chunk {}", chunk.id);
            }
            StlChunkParser.parse_chunk(chunk, bytes)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boom.stl");
    write_stl(&path, 40);
    let chunks = split(&path, 10);

    let err = ChunkCoordinator::new(Some(4), Duration::from_secs(10))
        .coordinate_parsing(&chunks, Arc::new(Explosive), &CancellationToken::new(), |_, _| {})
        .unwrap_err();
    match err {
        LoadError::ParseFailed { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(&failures[0].error, ChunkError::Panicked(m) if m.contains("corrupt record")));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_cancel_stops_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cancel.stl");
    write_stl(&path, 100);
    let chunks = split(&path, 10);
    assert_eq!(chunks.len(), 10);

    let parser = Arc::new(ScriptedParser::new(vec![Duration::from_millis(150); 10]));
    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        })
    };

    let started = Instant::now();
    let err = ChunkCoordinator::new(Some(2), Duration::from_secs(10))
        .coordinate_parsing(&chunks, Arc::clone(&parser), &token, |_, _| {})
        .unwrap_err();
    canceller.join().unwrap();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(parser.calls.load(Ordering::SeqCst), 2);
    assert_eq!(token.pending_callbacks(), 0);
}
