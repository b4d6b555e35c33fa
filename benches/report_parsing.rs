//! Benchmark for the btrfs report parsers
//!
//! The sampler parses every pool's membership, usage and qgroup listing on
//! each pass; large appliances carry thousands of qgroups.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use storage_pool_manager::domain::ports::split_lines;
use storage_pool_manager::filesystem::{
    parse_filesystem_show, parse_filesystem_usage, parse_qgroup_show, parse_scrub_status,
};

fn show_output(devices: usize) -> Vec<String> {
    let mut out = format!(
        "Label: 'data1'  uuid: 2b6e3a52-7d0f-4a8e-9c61-5f3a8d2e4b10\n\tTotal devices {} FS bytes used 196608\n",
        devices
    );
    for i in 0..devices {
        out.push_str(&format!(
            "\tdevid {:>4} size 10737418240 used 2185232384 path /dev/sd{}\n",
            i + 1,
            i
        ));
    }
    split_lines(&out)
}

fn qgroup_output(groups: usize) -> Vec<String> {
    let mut out = String::from("qgroupid         rfer         excl \n--------         ----         ---- \n");
    for i in 0..groups {
        out.push_str(&format!("0/{:<14} {:>12} {:>12}\n", 257 + i, 16384 * i, 4096 * i));
    }
    split_lines(&out)
}

fn bench_filesystem_reports(c: &mut Criterion) {
    let mut group = c.benchmark_group("filesystem_reports");
    group.throughput(Throughput::Elements(1));

    let show = show_output(24);
    group.bench_function("show_24_devices", |b| {
        b.iter(|| parse_filesystem_show(black_box(&show)))
    });

    let usage = split_lines(
        "Overall:\n    Device size:\t\t21474836480\n    Device allocated:\t\t4370464768\n    \
         Device unallocated:\t\t17104371712\n    Used:\t\t\t4370464768\n    \
         Free (estimated):\t\t17104371712\t(min: 17104371712)\n",
    );
    group.bench_function("usage", |b| {
        b.iter(|| parse_filesystem_usage(black_box(&usage)))
    });

    group.finish();
}

fn bench_qgroup_show(c: &mut Criterion) {
    let mut group = c.benchmark_group("qgroup_show");

    for groups in [16, 1024] {
        let lines = qgroup_output(groups);
        group.throughput(Throughput::Elements(groups as u64));
        group.bench_function(format!("{}_groups", groups), |b| {
            b.iter(|| parse_qgroup_show(black_box(&lines)))
        });
    }

    group.finish();
}

fn bench_scrub_status(c: &mut Criterion) {
    let mut group = c.benchmark_group("scrub_status");
    group.throughput(Throughput::Elements(1));

    let lines = split_lines(
        "UUID:             2b6e3a52-7d0f-4a8e-9c61-5f3a8d2e4b10\n\
         Status:           running\n\
         Duration:         1:12:05\n\
         Total to scrub:   4000000000\n\
         \tdata_bytes_scrubbed: 1000000000\n\
         \ttree_bytes_scrubbed: 5000000\n\
         \tread_errors: 0\n\
         \tcsum_errors: 0\n\
         \tverify_errors: 0\n\
         \tsuper_errors: 0\n\
         \tuncorrectable_errors: 0\n\
         \tcorrected_errors: 0\n",
    );
    group.bench_function("running_raw", |b| {
        b.iter(|| parse_scrub_status(black_box(&lines)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_filesystem_reports,
    bench_qgroup_show,
    bench_scrub_status
);
criterion_main!(benches);
