use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use par_zip::{zip_dirs, Archive, OpenMode, TaskState, ZipDirsOptions};

fn generate_compressible_data(size: usize) -> Vec<u8> {
    // Pattern that compresses well
    let pattern = b"The quick brown fox jumps over the lazy dog. ";
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        data.extend_from_slice(pattern);
    }
    data.truncate(size);
    data
}

fn prepare_tree(files: usize, file_size: usize) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("tree");
    fs::create_dir_all(&root).unwrap();
    let data = generate_compressible_data(file_size);
    for i in 0..files {
        fs::write(root.join(format!("file_{:03}.bin", i)), &data).unwrap();
    }
    (dir, root)
}

fn bench_thread_scaling(c: &mut Criterion) {
    let files = 16;
    let file_size = 4 * 1024 * 1024;
    let (_guard, root) = prepare_tree(files, file_size);

    let mut group = c.benchmark_group("zip_dirs_threads");
    group.sample_size(10);
    group.throughput(Throughput::Bytes((files * file_size) as u64));

    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let out = TempDir::new().unwrap();
                let zip_path = out.path().join("bench.zip");
                let archive = Archive::open(&zip_path, OpenMode::Create, None).unwrap();
                let task = TaskState::new();
                let opts = ZipDirsOptions {
                    threads,
                    compress_level: 6,
                    ..Default::default()
                };
                zip_dirs(&task, archive, &[root.clone()], &opts).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_block_sizes(c: &mut Criterion) {
    let (_guard, root) = prepare_tree(2, 32 * 1024 * 1024);

    let mut group = c.benchmark_group("zip_dirs_block_size");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(2 * 32 * 1024 * 1024));

    for block_mib in [1u64, 4, 8, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(block_mib),
            &block_mib,
            |b, &block_mib| {
                b.iter(|| {
                    let out = TempDir::new().unwrap();
                    let zip_path = out.path().join("bench.zip");
                    let archive = Archive::open(&zip_path, OpenMode::Create, None).unwrap();
                    let task = TaskState::new();
                    let opts = ZipDirsOptions {
                        threads: 4,
                        max_block_size: block_mib * 1024 * 1024,
                        ..Default::default()
                    };
                    zip_dirs(&task, archive, &[root.clone()], &opts).unwrap();
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_thread_scaling, bench_block_sizes);
criterion_main!(benches);
