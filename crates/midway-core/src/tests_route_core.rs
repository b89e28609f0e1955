#[test]
fn session_ids_are_unique_and_increasing() {
    let core = super::ProxyCore::new(
        midway_policy::SuffixRouter::default(),
        midway_observe::NoopEventSink,
    );
    let first = core.begin_session("127.0.0.1:50000", "a.example.com", 443);
    let second = core.begin_session("127.0.0.1:50001", "b.example.com", 443);
    assert!(second.session_id > first.session_id);
}

#[test]
fn route_decision_consults_policy_and_emits_event() {
    let core = super::ProxyCore::new(
        midway_policy::SuffixRouter::new(["google.com"]),
        midway_observe::VecEventSink::default(),
    );

    let matched = core.begin_session("127.0.0.1:50000", "www.google.com", 443);
    assert_eq!(core.decide_route(&matched), super::RouteBinding::Engine);

    let unmatched = core.begin_session("127.0.0.1:50001", "example.org", 443);
    assert_eq!(core.decide_route(&unmatched), super::RouteBinding::Direct);

    let events = core.sink().snapshot();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, midway_observe::EventKind::RouteDecision);
    assert_eq!(
        events[0].attributes.get("route").map(String::as_str),
        Some("engine")
    );
    assert_eq!(
        events[1].attributes.get("route").map(String::as_str),
        Some("direct")
    );
}

#[test]
fn reload_changes_subsequent_route_decisions() {
    let core = super::ProxyCore::new(
        midway_policy::SuffixRouter::new(["google.com"]),
        midway_observe::NoopEventSink,
    );
    let context = core.begin_session("127.0.0.1:50000", "www.google.com", 443);
    assert_eq!(core.decide_route(&context), super::RouteBinding::Engine);

    core.router().reload(["example.org"]);
    assert_eq!(core.decide_route(&context), super::RouteBinding::Direct);
}
