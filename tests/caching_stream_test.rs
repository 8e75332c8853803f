use bytes::Bytes;
use edge_node::caching_stream::{CacheOutcome, CachingStream};
use edge_node::disk_cache::{DiskCache, Editor};
use futures::{stream, StreamExt, TryStreamExt};
use http_body_util::StreamBody;
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

fn open_cache(temp_dir: &TempDir) -> Arc<DiskCache> {
    DiskCache::open(temp_dir.path(), 2, 1, 1024 * 1024).unwrap()
}

fn editor_with_metadata(cache: &Arc<DiskCache>, key: &str) -> Editor {
    let mut editor = cache.edit(key).unwrap().unwrap();
    editor.set(1, b"{}").unwrap();
    editor
}

fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, io::Error>> {
    parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
}

fn outcome_channel() -> (
    Box<dyn FnOnce(CacheOutcome) + Send + 'static>,
    oneshot::Receiver<CacheOutcome>,
) {
    let (tx, rx) = oneshot::channel();
    let callback = Box::new(move |outcome: CacheOutcome| {
        let _ = tx.send(outcome);
    });
    (callback, rx)
}

async fn wait_for(rx: oneshot::Receiver<CacheOutcome>) -> CacheOutcome {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("cache writer did not finish")
        .expect("callback dropped without firing")
}

async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
    for _ in 0..500 {
        if counter.load(Ordering::SeqCst) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "upstream polled {} times, expected {}",
        counter.load(Ordering::SeqCst),
        expected
    );
}

fn cached_payload(cache: &Arc<DiskCache>, key: &str) -> Option<Vec<u8>> {
    let mut snapshot = cache.get(key).unwrap()?;
    Some(snapshot.read_slot(0).unwrap())
}

#[tokio::test]
async fn test_full_read_commits_entry() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (callback, rx) = outcome_channel();

    let upstream = stream::iter(chunks(&["hello ", "world"]));
    let caching = CachingStream::new(
        upstream,
        editor_with_metadata(&cache, "image"),
        0,
        Some(11),
        callback,
    );

    let received: Vec<Bytes> = caching.try_collect().await.unwrap();
    assert_eq!(received.concat(), b"hello world");

    assert_eq!(wait_for(rx).await, CacheOutcome::Committed(11));
    assert_eq!(cached_payload(&cache, "image").unwrap(), b"hello world");
}

#[tokio::test]
async fn test_unknown_length_commits_what_arrived() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (callback, rx) = outcome_channel();

    let upstream = stream::iter(chunks(&["a", "bc", "def"]));
    let mut caching = CachingStream::new(
        upstream,
        editor_with_metadata(&cache, "image"),
        0,
        None,
        callback,
    );

    while let Some(chunk) = caching.next().await {
        chunk.unwrap();
    }
    assert_eq!(caching.bytes_passed(), 6);
    drop(caching);

    assert_eq!(wait_for(rx).await, CacheOutcome::Committed(6));
    assert_eq!(cached_payload(&cache, "image").unwrap(), b"abcdef");
}

#[tokio::test]
async fn test_length_mismatch_aborts() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (callback, rx) = outcome_channel();

    let upstream = stream::iter(chunks(&["short"]));
    let caching = CachingStream::new(
        upstream,
        editor_with_metadata(&cache, "image"),
        0,
        Some(100),
        callback,
    );

    let received: Vec<Bytes> = caching.try_collect().await.unwrap();
    assert_eq!(received.concat(), b"short");

    assert_eq!(wait_for(rx).await, CacheOutcome::Aborted);
    assert!(cache.get("image").unwrap().is_none());
    assert!(cache.edit("image").unwrap().is_some());
}

#[tokio::test]
async fn test_upstream_error_reaches_consumer_and_aborts() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (callback, rx) = outcome_channel();

    let upstream = stream::iter(vec![
        Ok(Bytes::from_static(b"partial")),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
    ]);
    let mut caching = CachingStream::new(
        upstream,
        editor_with_metadata(&cache, "image"),
        0,
        Some(20),
        callback,
    );

    assert_eq!(caching.next().await.unwrap().unwrap(), "partial");
    let err = caching.next().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    assert!(caching.next().await.is_none());

    assert_eq!(wait_for(rx).await, CacheOutcome::Aborted);
    assert!(cache.get("image").unwrap().is_none());
}

#[tokio::test]
async fn test_early_drop_drains_upstream_then_aborts() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (callback, rx) = outcome_channel();

    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);
    let upstream = stream::iter(chunks(&["one", "two", "three"])).inspect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut caching = CachingStream::new(
        upstream,
        editor_with_metadata(&cache, "image"),
        0,
        Some(11),
        callback,
    );
    assert_eq!(caching.next().await.unwrap().unwrap(), "one");
    drop(caching);

    assert_eq!(wait_for(rx).await, CacheOutcome::Aborted);
    assert_eq!(pulled.load(Ordering::SeqCst), 3);
    assert!(cache.get("image").unwrap().is_none());
}

#[tokio::test]
async fn test_consumer_is_not_affected_by_closed_cache() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (callback, rx) = outcome_channel();

    let editor = editor_with_metadata(&cache, "image");
    cache.close().unwrap();

    let upstream = stream::iter(chunks(&["still ", "served"]));
    let caching = CachingStream::new(upstream, editor, 0, Some(12), callback);

    let received: Vec<Bytes> = caching.try_collect().await.unwrap();
    assert_eq!(received.concat(), b"still served");
    assert_eq!(wait_for(rx).await, CacheOutcome::Aborted);
}

#[test]
fn test_without_runtime_streams_uncached() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (tx, rx) = std::sync::mpsc::channel();

    let upstream = stream::iter(chunks(&["no ", "runtime"]));
    let caching = CachingStream::new(
        upstream,
        editor_with_metadata(&cache, "image"),
        0,
        Some(10),
        Box::new(move |outcome: CacheOutcome| {
            let _ = tx.send(outcome);
        }),
    );

    assert_eq!(rx.recv().unwrap(), CacheOutcome::Aborted);

    let received: Vec<Bytes> = futures::executor::block_on(caching.try_collect()).unwrap();
    assert_eq!(received.concat(), b"no runtime");
    assert!(cache.get("image").unwrap().is_none());
}

#[tokio::test]
async fn test_http1_body_with_content_length_commits() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (callback, rx) = outcome_channel();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pending = Arc::new(Mutex::new(Some((
        editor_with_metadata(&cache, "image"),
        callback,
    ))));

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let service = service_fn(move |_req: Request<Incoming>| {
            let pending = Arc::clone(&pending);
            async move {
                let (editor, callback) = pending.lock().unwrap().take().unwrap();
                let upstream = stream::iter(chunks(&["hello ", "world"]));
                let caching = CachingStream::new(upstream, editor, 0, Some(11), callback);
                let response = Response::builder()
                    .header("content-length", "11")
                    .body(StreamBody::new(caching.map_ok(Frame::data)))
                    .unwrap();
                Ok::<_, hyper::Error>(response)
            }
        });
        let _ = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await;
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /image HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();
    let response = String::from_utf8_lossy(&raw);
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("\r\n\r\nhello world"), "{}", response);

    assert_eq!(wait_for(rx).await, CacheOutcome::Committed(11));
    assert_eq!(cached_payload(&cache, "image").unwrap(), b"hello world");
}

#[tokio::test]
async fn test_failed_writer_still_drains_upstream() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (callback, rx) = outcome_channel();

    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);
    let upstream = stream::iter(chunks(&["a", "b", "c", "d", "e"])).inspect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // slot 7 does not exist, so the writer gives up on the first chunk
    let mut caching = CachingStream::new(
        upstream,
        editor_with_metadata(&cache, "image"),
        7,
        Some(5),
        callback,
    );
    assert_eq!(caching.next().await.unwrap().unwrap(), "a");
    assert_eq!(caching.next().await.unwrap().unwrap(), "b");
    drop(caching);

    assert_eq!(wait_for(rx).await, CacheOutcome::Aborted);
    wait_for_count(&pulled, 5).await;
    assert!(cache.get("image").unwrap().is_none());
}

#[test]
fn test_without_runtime_early_drop_drains_upstream() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_cache(&temp_dir);
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    let upstream = stream::iter(chunks(&["one", "two", "three"]))
        .chain(stream::once(async move {
            let _ = done_tx.send(());
            Ok::<_, io::Error>(Bytes::from_static(b"four"))
        }))
        .boxed();
    let mut caching = CachingStream::new(
        upstream,
        editor_with_metadata(&cache, "image"),
        0,
        None,
        Box::new(|_outcome: CacheOutcome| {}),
    );

    let first = futures::executor::block_on(caching.next()).unwrap().unwrap();
    assert_eq!(first, "one");
    drop(caching);

    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}
