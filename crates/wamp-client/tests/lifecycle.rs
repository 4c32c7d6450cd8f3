//! Session lifecycle: joining, authentication, leaving, and transport loss.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use wamp_client::{
    memory_pair, CallOptions, CloseDetails, PublishOptions, RegisterOptions, Session,
    SessionConfig, SessionState, TicketAuth, WampError,
};
use wamp_core::{uris, Dict, Message};

use common::{expect_closed, join, next, within, SESSION_ID};

/// Records lifecycle events in the order they fire.
fn record_lifecycle(session: &Session) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        session.on_connect(move |_s| log.lock().push("connect".to_string()));
    }
    {
        let log = log.clone();
        session.on_join(move |_s, details| log.lock().push(format!("join:{}", details.session_id)));
    }
    {
        let log = log.clone();
        session.on_leave(move |_s, close: &CloseDetails| log.lock().push(format!("leave:{}", close.reason)));
    }
    {
        let log = log.clone();
        session.on_disconnect(move |_s, clean| log.lock().push(format!("disconnect:{clean}")));
    }
    log
}

#[tokio::test]
async fn join_announces_roles_and_records_session() {
    let session = Session::new(SessionConfig::default());
    let (transport, mut peer) = memory_pair();
    let joined = session.connect(transport).unwrap();

    let details = match next(&mut peer).await {
        Message::Hello { realm, details } => {
            assert_eq!(realm, "realm1");
            details
        }
        other => panic!("expected HELLO, got {other:?}"),
    };
    let roles = details["roles"].as_object().unwrap();
    for role in ["caller", "callee", "publisher", "subscriber"] {
        assert!(roles.contains_key(role), "missing role {role}");
    }
    assert_eq!(details["authmethods"], json!(["anonymous"]));

    peer.send(Message::Welcome {
        session: SESSION_ID,
        details: common::welcome_details(),
    })
    .unwrap();
    let joined = within(joined).await.unwrap();

    assert_eq!(joined.session_id, SESSION_ID);
    assert_eq!(joined.authrole.as_deref(), Some("anonymous"));
    assert!(joined.router_roles.contains_key("dealer"));
    assert_eq!(session.state(), SessionState::Joined);
    assert_eq!(session.session_id(), Some(SESSION_ID));
}

#[tokio::test]
async fn operations_are_refused_until_joined() {
    let session = Session::new(SessionConfig::default());
    let call = || session.call("com.example.add2", vec![], Dict::new(), CallOptions::default());

    assert!(matches!(call(), Err(WampError::NotConnected)));

    let (transport, mut peer) = memory_pair();
    let joined = session.connect(transport).unwrap();
    assert!(matches!(next(&mut peer).await, Message::Hello { .. }));

    // Transport open, HELLO sent, not yet welcomed.
    assert_eq!(session.state(), SessionState::Connected);
    assert!(matches!(call(), Err(WampError::NotConnected)));
    assert!(matches!(
        session.register("com.example.add2", common::noop(), RegisterOptions::default()),
        Err(WampError::NotConnected)
    ));
    assert!(matches!(
        session.publish("com.example.topic", vec![], Dict::new(), PublishOptions::default()),
        Err(WampError::NotConnected)
    ));

    peer.send(Message::Welcome {
        session: SESSION_ID,
        details: Dict::new(),
    })
    .unwrap();
    within(joined).await.unwrap();

    assert!(call().is_ok());
    assert!(matches!(next(&mut peer).await, Message::Call { .. }));
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let session = Session::new(SessionConfig::default());
    let (_peer, _) = join(&session).await;
    let (transport, _other) = memory_pair();
    assert!(matches!(
        session.connect(transport),
        Err(WampError::InvalidState(_))
    ));
}

#[tokio::test]
async fn ticket_challenge_is_answered() {
    let session = Session::new(
        SessionConfig::new("realm1").with_authenticator(TicketAuth::new("joe", "secret!!!")),
    );
    let (transport, mut peer) = memory_pair();
    let joined = session.connect(transport).unwrap();

    match next(&mut peer).await {
        Message::Hello { details, .. } => {
            assert_eq!(details["authmethods"], json!(["ticket"]));
            assert_eq!(details["authid"], json!("joe"));
        }
        other => panic!("expected HELLO, got {other:?}"),
    }

    peer.send(Message::Challenge {
        auth_method: "ticket".into(),
        extra: Dict::new(),
    })
    .unwrap();
    match next(&mut peer).await {
        Message::Authenticate { signature, .. } => assert_eq!(signature, "secret!!!"),
        other => panic!("expected AUTHENTICATE, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Authenticating);

    let mut details = common::welcome_details();
    details.insert("authid".into(), json!("joe"));
    peer.send(Message::Welcome {
        session: 99,
        details,
    })
    .unwrap();
    let joined = within(joined).await.unwrap();
    assert_eq!(joined.authid.as_deref(), Some("joe"));
}

#[tokio::test]
async fn challenge_without_matching_authenticator_fails_connect() {
    let session = Session::new(
        SessionConfig::new("realm1").with_authenticator(TicketAuth::new("joe", "secret!!!")),
    );
    let log = record_lifecycle(&session);
    let (transport, mut peer) = memory_pair();
    let joined = session.connect(transport).unwrap();
    next(&mut peer).await;

    peer.send(Message::Challenge {
        auth_method: "wampcra".into(),
        extra: Dict::new(),
    })
    .unwrap();

    let err = within(joined).await.unwrap_err();
    assert!(matches!(err, WampError::NoMatchingAuthenticator { ref method } if method == "wampcra"));

    match next(&mut peer).await {
        Message::Abort { reason, .. } => assert_eq!(reason, uris::ERROR_NO_AUTH_METHOD),
        other => panic!("expected ABORT, got {other:?}"),
    }
    expect_closed(&mut peer).await;

    let exit = within(session.disconnected()).await;
    assert!(exit.was_clean);
    assert_eq!(session.state(), SessionState::Disconnected);
    // Never joined, so no leave.
    assert_eq!(*log.lock(), vec!["connect", "disconnect:true"]);
}

#[tokio::test]
async fn router_abort_fails_connect() {
    let session = Session::new(SessionConfig::new("nope"));
    let (transport, mut peer) = memory_pair();
    let joined = session.connect(transport).unwrap();
    match next(&mut peer).await {
        Message::Hello { details, .. } => assert!(!details.contains_key("authmethods")),
        other => panic!("expected HELLO, got {other:?}"),
    }

    let mut details = Dict::new();
    details.insert("message".into(), Value::from("no such realm"));
    peer.send(Message::Abort {
        details,
        reason: "wamp.error.no_such_realm".into(),
    })
    .unwrap();

    match within(joined).await.unwrap_err() {
        WampError::Aborted { reason, message } => {
            assert_eq!(reason, "wamp.error.no_such_realm");
            assert_eq!(message.as_deref(), Some("no such realm"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    within(session.disconnected()).await;
}

#[tokio::test]
async fn leave_waits_for_router_goodbye() {
    let session = Session::new(SessionConfig::default());
    let log = record_lifecycle(&session);
    let (mut peer, _) = join(&session).await;

    let leaving = session.leave(None, Some("bye")).unwrap();
    match next(&mut peer).await {
        Message::Goodbye { details, reason } => {
            assert_eq!(reason, uris::CLOSE_NORMAL);
            assert_eq!(details["message"], json!("bye"));
        }
        other => panic!("expected GOODBYE, got {other:?}"),
    }

    // Wait for the sequencer to enter Leaving, then new work is refused.
    within(async {
        while session.state() != SessionState::Leaving {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(matches!(
        session.call("com.example.add2", vec![], Dict::new(), CallOptions::default()),
        Err(WampError::NotConnected)
    ));

    peer.send(Message::Goodbye {
        details: Dict::new(),
        reason: uris::CLOSE_GOODBYE_AND_OUT.into(),
    })
    .unwrap();

    let close = within(leaving).await.unwrap();
    assert_eq!(close.reason, uris::CLOSE_GOODBYE_AND_OUT);

    let exit = within(session.disconnected()).await;
    assert!(exit.was_clean);
    assert!(session.session_id().is_none());
    assert_eq!(
        *log.lock(),
        vec![
            "connect".to_string(),
            format!("join:{SESSION_ID}"),
            format!("leave:{}", uris::CLOSE_GOODBYE_AND_OUT),
            "disconnect:true".to_string(),
        ]
    );
}

#[tokio::test]
async fn router_goodbye_is_acknowledged() {
    let session = Session::new(SessionConfig::default());
    let log = record_lifecycle(&session);
    let (mut peer, _) = join(&session).await;

    peer.send(Message::Goodbye {
        details: Dict::new(),
        reason: uris::CLOSE_SYSTEM_SHUTDOWN.into(),
    })
    .unwrap();

    match next(&mut peer).await {
        Message::Goodbye { reason, .. } => assert_eq!(reason, uris::CLOSE_GOODBYE_AND_OUT),
        other => panic!("expected GOODBYE, got {other:?}"),
    }
    let exit = within(session.disconnected()).await;
    assert!(exit.was_clean);
    assert_eq!(exit.reason.as_deref(), Some(uris::CLOSE_SYSTEM_SHUTDOWN));
    assert!(log
        .lock()
        .contains(&format!("leave:{}", uris::CLOSE_SYSTEM_SHUTDOWN)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_loss_fails_every_pending_operation() {
    let session = Session::new(SessionConfig::default());
    let log = record_lifecycle(&session);
    let (mut peer, _) = join(&session).await;

    const K: usize = 5;
    let mut calls = Vec::new();
    for i in 0..K {
        calls.push(
            session
                .call("com.example.slow", vec![json!(i)], Dict::new(), CallOptions::default())
                .unwrap(),
        );
    }
    let registering = session
        .register("com.example.add2", common::noop(), RegisterOptions::default())
        .unwrap();
    let publishing = session
        .publish("com.example.topic", vec![], Dict::new(), PublishOptions::acknowledged())
        .unwrap();

    // Make sure every request reached the router before the line drops.
    for _ in 0..K + 2 {
        next(&mut peer).await;
    }
    peer.close(false, Some("connection reset".into()));

    for call in calls {
        assert!(matches!(within(call).await, Err(WampError::ConnectionClosed)));
    }
    assert!(matches!(within(registering).await, Err(WampError::ConnectionClosed)));
    assert!(matches!(within(publishing).await, Err(WampError::ConnectionClosed)));

    let exit = within(session.disconnected()).await;
    assert!(!exit.was_clean);
    assert_eq!(exit.reason.as_deref(), Some("connection reset"));

    let log = log.lock().clone();
    assert_eq!(
        log.iter().filter(|e| e.starts_with("disconnect")).count(),
        1,
        "exactly one disconnect: {log:?}"
    );
    assert_eq!(log.last().map(String::as_str), Some("disconnect:false"));
    assert!(log.contains(&format!("leave:{}", uris::CLOSE_TRANSPORT_LOST)));

    assert!(matches!(
        session.call("com.example.slow", vec![], Dict::new(), CallOptions::default()),
        Err(WampError::NotConnected)
    ));
}

#[tokio::test]
async fn session_can_reconnect_after_disconnect() {
    let session = Session::new(SessionConfig::default());
    let (peer, _) = join(&session).await;
    drop(peer);
    let exit = within(session.disconnected()).await;
    assert!(!exit.was_clean);

    let (_peer, details) = join(&session).await;
    assert_eq!(details.session_id, SESSION_ID);
    assert!(session.is_joined());
}

#[tokio::test]
async fn listener_can_register_on_join() {
    let session = Session::new(SessionConfig::default());
    session.on_join(|s, _details| {
        let _pending = s.register(
            "com.example.ping",
            common::noop(),
            RegisterOptions::default(),
        )
        .expect("joined session accepts registrations");
    });

    let (mut peer, _) = join(&session).await;
    match next(&mut peer).await {
        Message::Register { procedure, .. } => assert_eq!(procedure, "com.example.ping"),
        other => panic!("expected REGISTER, got {other:?}"),
    }
}

#[tokio::test]
async fn unexpected_message_is_a_protocol_violation() {
    let session = Session::new(SessionConfig::default());
    let (transport, mut peer) = memory_pair();
    let joined = session.connect(transport).unwrap();
    next(&mut peer).await;

    // RESULT before WELCOME.
    peer.send(Message::Result {
        request: 1,
        details: Dict::new(),
        args: None,
        kwargs: None,
    })
    .unwrap();

    assert!(matches!(within(joined).await, Err(WampError::Protocol(_))));
    match next(&mut peer).await {
        Message::Abort { reason, .. } => assert_eq!(reason, uris::ERROR_PROTOCOL_VIOLATION),
        other => panic!("expected ABORT, got {other:?}"),
    }
    let exit = within(session.disconnected()).await;
    assert!(!exit.was_clean);
}
