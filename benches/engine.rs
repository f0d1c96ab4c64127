use std::hint::black_box;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::future::{BoxFuture, join_all};
use http::header::{CONTENT_ENCODING, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::runtime::Runtime;
use volley::prelude::{Client, RetryOptions};
use volley::{AttemptProbe, BoxError, ResponseLike, Transport, TransportRequest};

/// Answers every attempt with the same canned response, no sockets involved.
struct CannedTransport {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Transport for CannedTransport {
    fn perform(
        &self,
        request: TransportRequest,
        probe: AttemptProbe,
    ) -> BoxFuture<'static, Result<ResponseLike, BoxError>> {
        let response = ResponseLike::new(self.status, self.headers.clone(), self.body.clone());
        Box::pin(async move {
            probe.socket(true, false);
            let (_, _, _, body) = request.into_parts();
            body.collect_bytes().await?;
            Ok(response)
        })
    }
}

fn benchmark_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build benchmark runtime")
}

fn benchmark_client(headers: HeaderMap, body: impl Into<Bytes>) -> Client {
    Client::builder()
        .prefix_url("http://bench.test/")
        .timeout(Duration::from_secs(2))
        .retry(RetryOptions::disabled())
        .transport(Arc::new(CannedTransport {
            status: StatusCode::OK,
            headers,
            body: body.into(),
        }))
        .build()
}

fn bench_small_get_latency(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let client = benchmark_client(HeaderMap::new(), &br#"{"ok":true}"#[..]);

    let mut group = c.benchmark_group("small_get_latency");
    group.sample_size(80);
    group.bench_function("promise_200", |b| {
        b.to_async(&runtime).iter(|| async {
            let response = client
                .get("v1/ping")
                .send()
                .await
                .expect("small get request should succeed");
            black_box(response.status());
        });
    });
    group.bench_function("stream_200", |b| {
        b.to_async(&runtime).iter(|| async {
            let stream = client
                .get("v1/ping")
                .stream()
                .expect("stream should start");
            black_box(stream.bytes().await.expect("stream should finish"));
        });
    });
    group.finish();
}

fn bench_concurrent_get_throughput(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let client = Arc::new(benchmark_client(HeaderMap::new(), &br#"{"ok":true}"#[..]));

    let mut group = c.benchmark_group("concurrent_get_throughput");
    group.sample_size(40);

    for concurrency in [8_usize, 32, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                let client = Arc::clone(&client);
                b.to_async(&runtime).iter(|| {
                    let client = Arc::clone(&client);
                    async move {
                        let requests = (0..concurrency).map(|_| client.get("v1/ping").send());
                        for response in join_all(requests).await {
                            black_box(
                                response
                                    .expect("concurrent get request should succeed")
                                    .status(),
                            );
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_gzip_download(c: &mut Criterion) {
    const PAYLOAD_BYTES: usize = 256 * 1024;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&vec![b'v'; PAYLOAD_BYTES])
        .expect("write gzip payload");
    let compressed = encoder.finish().expect("finish gzip payload");
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

    let runtime = benchmark_runtime();
    let client = benchmark_client(headers, compressed);

    let mut group = c.benchmark_group("download_256k");
    group.sample_size(40);
    group.throughput(Throughput::Bytes(PAYLOAD_BYTES as u64));
    group.bench_function("gzip_decoded", |b| {
        b.to_async(&runtime).iter(|| async {
            let body = client
                .get("v1/blob")
                .send()
                .buffer()
                .await
                .expect("gzip download should succeed");
            black_box(body.len());
        });
    });
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(8));
    targets = bench_small_get_latency, bench_concurrent_get_throughput, bench_gzip_download
);
criterion_main!(benches);
