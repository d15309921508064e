use core::time::Duration;

use node_core::config::Timing;
use node_core::error::{Classify, FaultClass};
use node_core::session::{
    BusFault, RestartReason, SessionAction, SessionCell, SessionEvent, SessionState,
    SessionSupervisor,
};

fn retry_delay(actions: &[SessionAction]) -> Option<Duration> {
    actions.iter().find_map(|action| match action {
        SessionAction::ScheduleRetry { delay, .. } => Some(*delay),
        _ => None,
    })
}

#[test]
fn backoff_grows_until_cap_then_fails_permanently() {
    let timing = Timing {
        link_max_retries: 5,
        link_backoff_first: Duration::from_secs(1),
        link_backoff_max: Duration::from_secs(8),
        ..Timing::default()
    };
    let cell = SessionCell::new();
    let mut supervisor = SessionSupervisor::new(&cell, &timing);
    supervisor.start();

    let mut delays = Vec::new();
    for _ in 0..5 {
        let actions = supervisor.handle(SessionEvent::LinkDown);
        let delay = retry_delay(&actions).expect("retry scheduled within budget");
        delays.push(delay.as_secs());
        assert_eq!(cell.view().state(), SessionState::Disconnected);

        let retry = supervisor.handle(SessionEvent::RetryDue);
        assert_eq!(retry.as_slice(), &[SessionAction::ConnectLink]);
    }
    assert_eq!(delays, [1, 2, 4, 8, 8]);
    assert!(delays.windows(2).all(|pair| pair[1] >= pair[0]));

    let actions = supervisor.handle(SessionEvent::LinkDown);
    assert!(actions.contains(&SessionAction::ShowFault));
    assert!(actions.contains(&SessionAction::Restart(RestartReason::LinkExhausted)));
    assert_eq!(cell.view().state(), SessionState::FailedPermanently);

    // Nothing moves a permanently failed session.
    assert!(supervisor.handle(SessionEvent::LinkUp).is_empty());
    assert_eq!(cell.view().state(), SessionState::FailedPermanently);
}

#[test]
fn reconnect_resubscribes_and_restarts_workers_with_new_epoch() {
    let cell = SessionCell::new();
    let mut supervisor = SessionSupervisor::new(&cell, &Timing::default());
    supervisor.start();
    supervisor.handle(SessionEvent::LinkUp);
    supervisor.handle(SessionEvent::BusConnected);
    assert_eq!(cell.view().epoch(), 1);

    let down = supervisor.handle(SessionEvent::LinkDown);
    assert!(down.contains(&SessionAction::StopWorkers {
        cancel_update: true
    }));
    supervisor.handle(SessionEvent::RetryDue);
    supervisor.handle(SessionEvent::LinkUp);
    let up = supervisor.handle(SessionEvent::BusConnected);

    assert_eq!(
        up.as_slice(),
        &[
            SessionAction::Subscribe,
            SessionAction::StartWorkers { epoch: 2 }
        ]
    );
    assert_eq!(cell.view().reconnects(), 1);
    assert_eq!(supervisor.link_failures(), 0);
}

#[test]
fn bus_start_failures_fall_back_to_link_reconnect() {
    let timing = Timing {
        bus_start_attempts: 5,
        bus_start_delay: Duration::from_millis(5_000),
        ..Timing::default()
    };
    let cell = SessionCell::new();
    let mut supervisor = SessionSupervisor::new(&cell, &timing);
    supervisor.start();
    supervisor.handle(SessionEvent::LinkUp);

    for _ in 0..4 {
        let actions = supervisor.handle(SessionEvent::BusStartFailed);
        assert_eq!(retry_delay(&actions), Some(Duration::from_millis(5_000)));
        assert_eq!(
            supervisor.handle(SessionEvent::RetryDue).as_slice(),
            &[SessionAction::StartBus]
        );
    }

    let actions = supervisor.handle(SessionEvent::BusStartFailed);
    assert!(actions.contains(&SessionAction::DisconnectLink));
    assert_eq!(retry_delay(&actions), Some(timing.link_backoff_first));
    assert_eq!(supervisor.link_failures(), 1);
}

#[test]
fn protocol_fault_restarts_with_detail() {
    let cell = SessionCell::new();
    let mut supervisor = SessionSupervisor::new(&cell, &Timing::default());
    supervisor.start();
    supervisor.handle(SessionEvent::LinkUp);
    supervisor.handle(SessionEvent::BusConnected);

    let fault = BusFault::Transport {
        transport_code: 0x8008,
        tls_stack_code: 0x2700,
        cert_verify_flags: 0x08,
    };
    assert_eq!(fault.classify(), FaultClass::ProtocolAuth);

    let actions = supervisor.handle(SessionEvent::BusError(fault));
    assert_eq!(
        actions.as_slice(),
        &[
            SessionAction::StopWorkers {
                cancel_update: true
            },
            SessionAction::ShowFault,
            SessionAction::Restart(RestartReason::BusFault(fault)),
        ]
    );
    assert_eq!(
        fault.to_string(),
        "transport error 0x8008, tls stack 0x2700, cert flags 0x8"
    );
}

#[test]
fn bus_drop_after_link_loss_keeps_link_retry() {
    let cell = SessionCell::new();
    let mut supervisor = SessionSupervisor::new(&cell, &Timing::default());
    supervisor.start();
    supervisor.handle(SessionEvent::LinkUp);
    supervisor.handle(SessionEvent::BusConnected);

    let down = supervisor.handle(SessionEvent::LinkDown);
    assert_eq!(retry_delay(&down), Some(Duration::from_secs(1)));
    // The bus client notices the same outage a moment later.
    let bus = supervisor.handle(SessionEvent::BusDisconnected);
    assert_eq!(retry_delay(&bus), None);
    assert_eq!(cell.view().state(), SessionState::Disconnected);

    assert_eq!(
        supervisor.handle(SessionEvent::RetryDue).as_slice(),
        &[SessionAction::ConnectLink]
    );
    assert_eq!(cell.view().state(), SessionState::Connecting);
    assert_eq!(supervisor.link_failures(), 1);
}
