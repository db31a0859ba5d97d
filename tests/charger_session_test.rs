mod common;

use common::{Device, charger};
use std::sync::atomic::Ordering;
use zerogrid::charger::{ChargerModel, SessionState, Setpoint};

#[tokio::test]
async fn connect_classifies_model_once() {
    let device = Device::rd6006();
    let mut session = charger(&device);
    session.connect_once().await.unwrap();

    assert!(session.is_connected());
    assert_eq!(session.model(), ChargerModel::Rd6006);
    assert_eq!(session.state().id, Some(60062));
    assert_eq!(session.state().serial_number.as_deref(), Some("00012345"));
    assert_eq!(session.state().multipliers.current, 1000.0);

    // A later id change on the wire does not reclassify
    device.registers.lock().unwrap()[0] = 60121;
    session.reconnect().await.unwrap();
    assert_eq!(session.model(), ChargerModel::Rd6006);
}

#[tokio::test]
async fn failed_identification_keeps_defaults_until_next_connect() {
    let device = Device::rd6006();
    device.fail_next_io.store(1, Ordering::SeqCst);
    let mut session = charger(&device);

    assert!(session.connect_once().await.is_err());
    assert_eq!(session.model(), ChargerModel::Unknown);
    assert_eq!(session.state().multipliers.current, 100.0);

    session.connect_once().await.unwrap();
    assert_eq!(session.model(), ChargerModel::Rd6006);
}

#[tokio::test]
async fn session_calls_run_on_spawned_tasks() {
    let device = Device::rd6006();
    let mut session = charger(&device);
    session.connect_once().await.unwrap();
    // One dropped read forces the retry pause inside the spawned future
    device.fail_next_io.store(1, Ordering::SeqCst);
    let id = tokio::spawn(async move { session.get_id().await })
    .await
    .unwrap();
    assert_eq!(id, Some(60062));
}

#[tokio::test]
async fn silent_device_fails_connect_even_though_port_opens() {
    let device = Device::rd6006();
    device.mute.store(true, Ordering::SeqCst);
    let mut session = charger(&device);

    let err = session.connect_once().await.unwrap_err();
    assert!(err.to_string().contains("no reply"));
    assert_eq!(device.opens.load(Ordering::SeqCst), 1);
    assert!(!session.is_connected());
    assert_eq!(session.model(), ChargerModel::Unknown);

    device.mute.store(false, Ordering::SeqCst);
    session.connect_once().await.unwrap();
    assert!(session.is_connected());
    assert_eq!(session.model(), ChargerModel::Rd6006);
}

#[tokio::test]
async fn setters_write_rounded_register_units() {
    let device = Device::rd6006();
    let mut session = charger(&device);
    session.connect_once().await.unwrap();

    assert!(session.set_i_set(300.0 / 57.0).await);
    assert_eq!(device.register(9), 5263);
    assert!(session.set_v_set(56.996).await);
    assert_eq!(device.register(8), 5700);
    assert_eq!(
        session.state().v_set,
        Some(Setpoint {
            value: 57.0,
            confirmed: true
        })
    );
    assert_eq!(session.get_v_out().await, Some(57.0));
}

#[tokio::test]
async fn exhausted_retries_return_sentinel_and_leave_connected() {
    let device = Device::rd6006();
    let mut session = charger(&device);
    session.connect_once().await.unwrap();

    device.offline.store(true, Ordering::SeqCst);
    let opens_before = device.opens.load(Ordering::SeqCst);

    assert_eq!(session.get_id().await, None);
    assert_ne!(session.session_state(), SessionState::Connected);
    assert!(!session.is_connected());
    // Every retry after the fault went through a fresh reconnect
    assert_eq!(device.opens.load(Ordering::SeqCst) - opens_before, 2);

    assert_eq!(session.get_v_out().await, None);
    assert!(!session.is_connected());

    device.offline.store(false, Ordering::SeqCst);
    assert_eq!(session.get_id().await, Some(60062));
    assert_eq!(session.session_state(), SessionState::Connected);
}

#[tokio::test]
async fn transient_fault_recovers_within_retries() {
    let device = Device::rd6006();
    let mut session = charger(&device);
    session.connect_once().await.unwrap();

    device.fail_next_io.store(1, Ordering::SeqCst);
    assert_eq!(session.get_v_out().await, Some(57.0));
    assert!(session.is_connected());
}

#[tokio::test]
async fn failed_write_is_cached_unconfirmed() {
    let device = Device::rd6006();
    let mut session = charger(&device);
    session.connect_once().await.unwrap();

    device.offline.store(true, Ordering::SeqCst);
    assert!(!session.set_v_set(50.0).await);
    assert_eq!(
        session.state().v_set,
        Some(Setpoint {
            value: 50.0,
            confirmed: false
        })
    );
    assert_eq!(device.register(8), 5700);
}

#[tokio::test]
async fn bulk_update_fans_out_in_one_read() {
    let device = Device::rd6006();
    {
        let mut regs = device.registers.lock().unwrap();
        regs[4] = 0;
        regs[5] = 31;
        regs[9] = 5263;
        regs[11] = 5100;
        regs[13] = 29070;
        regs[14] = 6000;
        regs[17] = 1;
        regs[18] = 1;
    }
    let mut session = charger(&device);
    session.connect_once().await.unwrap();
    let reads_before = device.reads.load(Ordering::SeqCst);

    assert!(session.update().await);
    assert_eq!(device.reads.load(Ordering::SeqCst) - reads_before, 1);

    let state = session.state();
    assert_eq!(state.int_temp_c, Some(31));
    assert_eq!(state.v_out, Some(57.0));
    assert_eq!(state.i_out, Some(5.1));
    assert_eq!(state.p_out, Some(290.7));
    assert_eq!(state.v_in, Some(60.0));
    assert_eq!(state.i_set.map(|s| s.value), Some(5.263));
    assert_eq!(state.output.map(|s| s.value), Some(true));
}
