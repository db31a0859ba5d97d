mod common;

use common::{Device, Recorder, charger, inverter, inverter_config};
use std::sync::atomic::Ordering;
use std::time::Duration;
use zerogrid::context::{DeviceContext, LocalActuators};
use zerogrid::controller::Actuators;
use zerogrid::inverter::InverterSession;
use zerogrid::rpc::HealthMonitor;

async fn running_context(recorder: &Recorder) -> DeviceContext {
    let device = Device::rd6006();
    let mut session = inverter(recorder).await;
    session.start(0).unwrap();
    DeviceContext::from_sessions(charger(&device), session)
}

async fn wait_for_fault(ctx: &DeviceContext) {
    for _ in 0..50 {
        if ctx.inverter.lock().await.is_faulted() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("heartbeat never stopped");
}

#[tokio::test]
async fn failing_heartbeat_surfaces_to_the_controller() {
    let recorder = Recorder::default();
    let ctx = running_context(&recorder).await;
    let mut actuators = LocalActuators::new(&ctx);

    recorder.fail.store(true, Ordering::SeqCst);
    wait_for_fault(&ctx).await;

    let err = actuators.set_inverter_power(500).await.unwrap_err();
    assert!(err.is_connection_error());
    {
        let health = ctx.inverter_health.read().await;
        assert!(!health.ok);
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_error.is_some());
    }
    {
        let session = ctx.inverter.lock().await;
        assert!(!session.is_running());
        assert!(session.link_status().consecutive_failures > 0);
    }

    recorder.fail.store(false, Ordering::SeqCst);
    assert_eq!(actuators.set_inverter_power(300).await.unwrap(), 300);
    assert!(ctx.inverter_health.read().await.ok);
    assert!(recorder.opens.load(Ordering::SeqCst) >= 2);
    assert_eq!(recorder.last_watts(), Some(300));

    let mut session = ctx.inverter.lock().await;
    assert!(session.is_running());
    session.stop().await.unwrap();
}

#[tokio::test]
async fn health_monitor_reconnects_a_dead_heartbeat() {
    let recorder = Recorder::default();
    let ctx = running_context(&recorder).await;
    let monitor = HealthMonitor::new(
        ctx.charger.clone(),
        ctx.charger_health.clone(),
        Duration::from_secs(2),
    )
    .with_inverter(ctx.inverter.clone(), ctx.inverter_health.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(monitor.check_inverter_once().await);
    assert!(ctx.inverter_health.read().await.ok);

    recorder.fail.store(true, Ordering::SeqCst);
    wait_for_fault(&ctx).await;
    let opens = recorder.opens.load(Ordering::SeqCst);
    assert!(!monitor.check_inverter_once().await);
    assert!(recorder.opens.load(Ordering::SeqCst) > opens);
    assert!(!ctx.inverter_health.read().await.ok);

    recorder.fail.store(false, Ordering::SeqCst);
    let mut recovered = false;
    for _ in 0..10 {
        if monitor.check_inverter_once().await {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(recovered);
    assert!(ctx.inverter_health.read().await.ok);
    assert!(ctx.inverter.lock().await.is_running());

    ctx.inverter.lock().await.stop().await.unwrap();
}

#[tokio::test]
async fn startup_connect_starts_the_heartbeat() {
    let recorder = Recorder::default();
    let device = Device::rd6006();
    let session = InverterSession::with_link(Box::new(recorder.clone()), &inverter_config());
    let ctx = DeviceContext::from_sessions(charger(&device), session);

    ctx.connect_inverter(Duration::from_millis(5), 120).await.unwrap();
    assert!(ctx.inverter.lock().await.is_running());
    assert!(ctx.inverter_health.read().await.ok);
    assert_eq!(recorder.opens.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.last_watts(), Some(120));

    // Already running: nothing is reopened
    ctx.connect_inverter(Duration::from_millis(5), 0).await.unwrap();
    assert_eq!(recorder.opens.load(Ordering::SeqCst), 1);
    ctx.inverter.lock().await.stop().await.unwrap();
}
