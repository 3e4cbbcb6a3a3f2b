//! Failure handling of channels and virtual connections
//!
//! Tests for:
//! - Refused and corrupted virtual connections
//! - Router loss and channel pool recovery
//! - Slow readers sharing a channel
//! - Large writes and the blocking facade

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ziti_core::protocol::ContentType;
use ziti_core::{ContextConfig, LoopbackDnsManager, SessionType, Ziti, ZitiContext, ZitiError, ZitiIdentity};
use ziti_integration_tests::fixtures::{
    FakeDialer, FakeEdgeRouter, IDENTITY, StubController, context_with, service, test_config,
    within,
};

const ER1: &str = "tls://er1.test:3022";

fn services() -> Vec<ziti_core::Service> {
    vec![
        service("echo-id", "echo", &[SessionType::Dial], Some(("echo.ziti", 7))),
        service("bind-only", "hosted", &[SessionType::Bind], None),
    ]
}

async fn active_context() -> (ZitiContext, Arc<FakeEdgeRouter>, Arc<FakeDialer>) {
    active_context_with(test_config()).await
}

async fn active_context_with(
    config: ContextConfig,
) -> (ZitiContext, Arc<FakeEdgeRouter>, Arc<FakeDialer>) {
    let controller = Arc::new(StubController::new(&[ER1]).then_services(services()));
    let router = FakeEdgeRouter::new();
    let dialer = FakeDialer::new(router.clone());
    let ctx = context_with(
        controller,
        dialer.clone(),
        Arc::new(LoopbackDnsManager::new()),
        config,
    );
    ctx.set_enabled(true);
    within(ctx.check_active()).await.unwrap();
    within(ctx.check_services_loaded()).await;
    (ctx, router, dialer)
}

#[tokio::test]
async fn test_rejected_connect() {
    let (ctx, router, _) = active_context().await;
    router.reject_connects("no terminators");

    let err = within(ctx.dial("echo")).await.unwrap_err();
    assert_eq!(err, ZitiError::ConnectionRejected("no terminators".into()));

    let channel = ctx.channel(ER1).unwrap();
    assert_eq!(channel.receiver_count(), 0);
    assert!(!channel.is_closed());
}

#[tokio::test]
async fn test_dial_without_permission() {
    let (ctx, _, dialer) = active_context().await;
    let err = within(ctx.dial("hosted")).await.unwrap_err();
    assert!(matches!(err, ZitiError::ServiceNotAvailable(_)));
    assert!(dialer.dials().is_empty());
}

#[tokio::test]
async fn test_corruption_is_isolated_per_connection() {
    let (ctx, router, _) = active_context().await;

    let mut bad = within(ctx.dial("echo")).await.unwrap();
    let mut good = within(ctx.dial("echo")).await.unwrap();
    assert_eq!(bad.channel().id(), good.channel().id());
    router.corrupt_echoes_on(bad.conn_id());

    within(bad.write(b"tampered")).await.unwrap();
    let err = within(bad.read()).await.unwrap_err();
    assert_eq!(err, ZitiError::DecryptionFailed);

    within(good.write(b"intact")).await.unwrap();
    assert_eq!(within(good.read()).await.unwrap().unwrap(), b"intact");
    assert!(!good.channel().is_closed());
}

#[tokio::test]
async fn test_slow_reader_does_not_stall_siblings() {
    let mut config = test_config();
    config.inbound_queue = 4;
    let (ctx, router, _) = active_context_with(config).await;

    let mut idle = within(ctx.dial("echo")).await.unwrap();
    let mut busy = within(ctx.dial("echo")).await.unwrap();
    assert_eq!(idle.channel().id(), busy.channel().id());

    for i in 0..32u8 {
        within(idle.write(&[i])).await.unwrap();
    }
    within(busy.write(b"ping")).await.unwrap();
    assert_eq!(within(busy.read()).await.unwrap().unwrap(), b"ping");
    assert!(!busy.channel().is_closed());

    // The idle connection gets what fit in its queue, then the overflow.
    let mut delivered = 0;
    let err = loop {
        match within(idle.read()).await {
            Ok(Some(_)) => delivered += 1,
            Ok(None) => panic!("overflowed connection ended cleanly"),
            Err(e) => break e,
        }
    };
    assert!(delivered <= 4, "{delivered}");
    assert!(matches!(err, ZitiError::InvalidState(_)), "{err:?}");
    assert!(idle.write(b"late").await.is_err());

    let conn_id = idle.conn_id();
    within(async {
        while !router
            .frames_of(ContentType::StateClosed)
            .iter()
            .any(|m| m.conn_id() == Some(conn_id))
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(busy.channel().receiver_count(), 1);

    within(busy.write(b"still here")).await.unwrap();
    assert_eq!(within(busy.read()).await.unwrap().unwrap(), b"still here");
}

#[tokio::test]
async fn test_router_loss_fails_connections_and_redials() {
    let (ctx, router, dialer) = active_context().await;

    let mut conn = within(ctx.dial("echo")).await.unwrap();
    let channel = conn.channel().clone();
    router.drop_links();

    let err = within(conn.read()).await.unwrap_err();
    assert!(matches!(err, ZitiError::ChannelClosed(_)), "{err:?}");
    assert!(channel.is_closed());

    // The close hook removes the channel from the pool.
    within(async {
        while !ctx.channel_addrs().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    let mut conn = within(ctx.dial("echo")).await.unwrap();
    assert_ne!(conn.channel().id(), channel.id());
    assert_eq!(dialer.dials().len(), 2);
    within(conn.write(b"back")).await.unwrap();
    assert_eq!(within(conn.read()).await.unwrap().unwrap(), b"back");
}

#[tokio::test]
async fn test_silent_router_times_out() {
    let mut config = test_config();
    config.hello_timeout = Duration::from_millis(100);

    let controller = Arc::new(StubController::new(&[ER1]).then_services(services()));
    let router = FakeEdgeRouter::new();
    router.go_silent();
    let ctx = context_with(
        controller,
        FakeDialer::new(router.clone()),
        Arc::new(LoopbackDnsManager::new()),
        config,
    );
    ctx.set_enabled(true);
    within(ctx.check_active()).await.unwrap();

    let err = within(ctx.dial("echo")).await.unwrap_err();
    assert!(matches!(err, ZitiError::EdgeRouterUnavailable(_)), "{err:?}");
    assert!(ctx.channel_addrs().is_empty());
    assert_eq!(router.frames_of(ContentType::Hello).len(), 1);
}

#[tokio::test]
async fn test_large_write_is_chunked() {
    let (ctx, router, _) = active_context().await;
    let mut conn = within(ctx.dial("echo")).await.unwrap();

    let payload: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
    within(conn.write_all(&payload)).await.unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        let chunk = within(conn.read()).await.unwrap().unwrap();
        echoed.extend_from_slice(&chunk);
    }
    assert_eq!(echoed, payload);

    let data_frames = router.frames_of(ContentType::Data);
    assert_eq!(data_frames.len(), 4);
}

#[tokio::test]
async fn test_close_sends_final_and_state_closed() {
    let (ctx, router, _) = active_context().await;
    let mut conn = within(ctx.dial("echo")).await.unwrap();
    let conn_id = conn.conn_id();

    within(conn.close()).await.unwrap();
    within(conn.close()).await.unwrap();
    assert!(conn.write(b"late").await.is_err());

    within(async {
        while router.frames_of(ContentType::StateClosed).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let closed = router.frames_of(ContentType::StateClosed);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].conn_id(), Some(conn_id));
    assert_eq!(conn.channel().receiver_count(), 0);
}

#[tokio::test]
async fn test_drop_without_close_sends_state_closed() {
    let (ctx, router, _) = active_context().await;
    let conn = within(ctx.dial("echo")).await.unwrap();
    let conn_id = conn.conn_id();
    let channel = conn.channel().clone();
    drop(conn);

    assert_eq!(channel.receiver_count(), 0);
    within(async {
        while router.frames_of(ContentType::StateClosed).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let closed = router.frames_of(ContentType::StateClosed);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].conn_id(), Some(conn_id));
}

#[test]
fn test_blocking_facade_dial_and_connect() {
    let dns = Arc::new(LoopbackDnsManager::new());
    let ziti = Ziti::with_config(test_config(), dns).unwrap();

    let controller = Arc::new(StubController::new(&[ER1]).then_services(services()));
    let router = FakeEdgeRouter::new();
    ziti.load_context_with(
        Arc::new(ZitiIdentity::new(IDENTITY, "https://ctrl.test:1280")),
        controller,
        FakeDialer::new(router),
        true,
    )
    .unwrap();
    ziti.wait_for_services();

    let mut conn = ziti.dial("echo").unwrap();
    conn.write_all(b"blocking").unwrap();
    let mut buf = [0u8; 8];
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"blocking");
    conn.close().unwrap();

    let ip = ziti.resolve("echo.ziti").expect("intercept address");
    let mut conn = ziti.connect(SocketAddr::new(ip, 7)).unwrap();
    assert_eq!(conn.get_ref().service(), "echo");
    conn.write_all(b"by addr").unwrap();
    let mut buf = [0u8; 7];
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"by addr");

    let err = ziti.connect("127.9.9.9:7".parse().unwrap()).unwrap_err();
    assert!(matches!(err, ZitiError::ServiceNotAvailable(_)));

    assert!(ziti.remove_context(IDENTITY));
    ziti.shutdown();
}

#[tokio::test]
async fn test_channel_meters_count_frames() {
    let (ctx, _, _) = active_context().await;
    let mut conn = within(ctx.dial("echo")).await.unwrap();
    within(conn.write(b"x")).await.unwrap();
    within(conn.read()).await.unwrap();

    let channel = conn.channel();
    // hello, connect, data out; result, connected, data in
    assert_eq!(channel.down_meter().count(), 3);
    within(async {
        while channel.up_meter().count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(channel.up_rate() >= 0.0);
}
