//! End-to-end tests: two connections talking over an in-memory link.

use std::time::Duration;

use bytes::Bytes;
use relink::mem::{self, MemLink, MemSubstrate};
use relink::{Conn, ConnConfig, RelinkError};

fn connect(config: ConnConfig) -> (Conn<MemSubstrate>, Conn<MemSubstrate>, MemLink) {
    let (a, b, link) = mem::pair();
    let a = Conn::new(a, config.clone()).unwrap();
    let b = Conn::new(b, config).unwrap();
    (a, b, link)
}

fn msg(i: usize) -> Bytes {
    Bytes::from(format!("msg-{i}"))
}

#[tokio::test]
async fn round_trip() {
    let (a, b, _link) = connect(ConnConfig::default());

    a.write(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(&b.read().await.unwrap()[..], b"ping");

    b.write(Bytes::from_static(b"pong")).await.unwrap();
    assert_eq!(&a.read().await.unwrap()[..], b"pong");
}

#[tokio::test]
async fn many_chunks_arrive_in_order() {
    let (a, b, _link) = connect(ConnConfig::default());

    let writer = tokio::spawn(async move {
        for i in 0..200 {
            a.write(msg(i)).await.unwrap();
        }
        a
    });
    for i in 0..200 {
        assert_eq!(b.read().await.unwrap(), msg(i), "chunk {i}");
    }
    let _a = writer.await.unwrap();
}

#[tokio::test]
async fn both_directions_at_once() {
    let (a, b, _link) = connect(ConnConfig::default());
    let a = std::sync::Arc::new(a);
    let b = std::sync::Arc::new(b);

    let mut tasks = Vec::new();
    for (from, to) in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
        tasks.push(tokio::spawn(async move {
            for i in 0..100 {
                from.write(msg(i)).await.unwrap();
            }
        }));
        tasks.push(tokio::spawn(async move {
            for i in 0..100 {
                assert_eq!(to.read().await.unwrap(), msg(i));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn stitch_mid_stream_is_invisible_to_the_application() {
    let (a, b, link) = connect(ConnConfig::default());

    for i in 0..10 {
        a.write(msg(i)).await.unwrap();
    }
    for i in 0..5 {
        assert_eq!(b.read().await.unwrap(), msg(i));
    }

    link.stitch();
    for i in 10..20 {
        a.write(msg(i)).await.unwrap();
    }
    link.stitch();
    for i in 20..30 {
        a.write(msg(i)).await.unwrap();
    }

    for i in 5..30 {
        assert_eq!(b.read().await.unwrap(), msg(i), "chunk {i}");
    }
}

#[tokio::test]
async fn lost_frames_are_recovered_after_a_stitch() {
    let config = ConnConfig {
        memory_cap: 64,
        ..ConnConfig::default()
    };
    let (a, b, link) = connect(config);

    link.set_loss(0.3);
    for i in 0..40 {
        a.write(msg(i)).await.unwrap();
    }
    // Let the lossy leg carry what it can, then heal it. The stitch makes
    // each side tell the other where to resume from.
    tokio::time::sleep(Duration::from_millis(20)).await;
    link.set_loss(0.0);
    link.stitch();

    for i in 0..40 {
        assert_eq!(b.read().await.unwrap(), msg(i), "chunk {i}");
    }
}

#[tokio::test]
async fn acks_release_buffer_space() {
    // A tiny buffer only keeps moving if acks prune it.
    let config = ConnConfig {
        memory_cap: 4,
        ack_frequency: 2,
        ..ConnConfig::default()
    };
    let (a, b, _link) = connect(config);

    let reader = tokio::spawn(async move {
        for i in 0..50 {
            assert_eq!(b.read().await.unwrap(), msg(i));
        }
        b
    });
    for i in 0..50 {
        tokio::time::timeout(Duration::from_secs(5), a.write(msg(i)))
            .await
            .expect("write stalled")
            .unwrap();
    }
    let _b = reader.await.unwrap();
}

#[tokio::test]
async fn writes_succeed_while_the_substrate_drops_everything() {
    let (a, _b, link) = connect(ConnConfig::default());
    link.set_loss(1.0);
    for i in 0..20 {
        a.write(msg(i)).await.unwrap();
    }
}

#[tokio::test]
async fn severed_substrate_surfaces_once_through_read() {
    let (a, b, link) = connect(ConnConfig::default());

    a.write(Bytes::from_static(b"before")).await.unwrap();
    assert_eq!(&b.read().await.unwrap()[..], b"before");

    link.sever();
    let err = b.read().await.unwrap_err();
    assert!(matches!(err, RelinkError::Transport(_)), "got {err:?}");
    // after the terminal error the channel is simply closed
    assert!(matches!(
        b.read().await.unwrap_err(),
        RelinkError::ConnectionAborted
    ));

    b.closed().await;
    let err = b.write(Bytes::from_static(b"after")).await.unwrap_err();
    assert!(matches!(err, RelinkError::ConnectionAborted));
    drop(a);
}

#[tokio::test]
async fn oversized_write_is_rejected() {
    let config = ConnConfig {
        max_payload: 8,
        ..ConnConfig::default()
    };
    let (a, _b, _link) = connect(config);
    let err = a.write(vec![0u8; 9]).await.unwrap_err();
    assert!(matches!(err, RelinkError::PayloadTooLarge { size: 9, max: 8 }));
    a.write(vec![0u8; 8]).await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let (a, _b, _link) = mem::pair();
    let config = ConnConfig {
        memory_cap: 0,
        ..ConnConfig::default()
    };
    assert!(matches!(
        Conn::new(a, config),
        Err(RelinkError::InvalidConfig(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_flushes_everything_on_a_threaded_runtime() {
    for _ in 0..20 {
        let (a, b, _link) = connect(ConnConfig::default());
        a.write(Bytes::from_static(b"warm")).await.unwrap();
        assert_eq!(&b.read().await.unwrap()[..], b"warm");

        for i in 0..10 {
            a.write(msg(i)).await.unwrap();
        }
        a.close().await.unwrap();
        for i in 0..10 {
            let chunk = tokio::time::timeout(Duration::from_secs(2), b.read())
                .await
                .unwrap_or_else(|_| panic!("chunk {i} never arrived"))
                .unwrap();
            assert_eq!(chunk, msg(i));
        }
        a.closed().await;
    }
}
