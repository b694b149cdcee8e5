//! Group fan-out and mailbox ordering against on-disk stores.

use std::sync::Arc;

use overstory::mail::{MailClient, SendOptions};
use overstory::session::{AgentSession, Capability, SessionState};

use crate::fixtures::StateHarness;

fn client(h: &StateHarness) -> MailClient {
    MailClient::new(Arc::clone(&h.mail), Arc::clone(&h.sessions))
}

fn spawn(h: &StateHarness, name: &str, capability: Capability) {
    let session = AgentSession::new(
        name,
        capability,
        "/tmp/wt",
        format!("overstory/{}/t", name),
        "t",
        format!("overstory_{}", name),
    );
    h.sessions.upsert(&session).unwrap();
}

#[test]
fn builders_group_excludes_sender_and_other_capabilities() {
    let h = StateHarness::new();
    let mail = client(&h);
    spawn(&h, "A", Capability::Builder);
    spawn(&h, "B", Capability::Builder);
    spawn(&h, "C", Capability::Scout);

    let ids = mail
        .send("A", "@builders", "subject", "hi", SendOptions::default())
        .unwrap();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.mail.get_by_id(&ids[0]).unwrap().unwrap().to, "B");

    let ids = mail
        .send("A", "@all", "subject", "hi", SendOptions::default())
        .unwrap();
    assert_eq!(ids.len(), 2);
    let mut recipients: Vec<String> = ids
        .iter()
        .map(|id| h.mail.get_by_id(id).unwrap().unwrap().to)
        .collect();
    recipients.sort();
    assert_eq!(recipients, vec!["B", "C"]);
}

#[test]
fn fanout_count_matches_active_set_minus_sender() {
    let h = StateHarness::new();
    let mail = client(&h);
    for i in 0..5 {
        spawn(&h, &format!("builder-{}", i), Capability::Builder);
    }
    // One drops out before the send
    h.sessions
        .update_state("builder-3", SessionState::Zombie)
        .unwrap();

    let ids = mail
        .send("builder-0", "@all", "s", "body", SendOptions::default())
        .unwrap();
    // 5 spawned - 1 zombie - 1 sender
    assert_eq!(ids.len(), 3);

    // All rows share subject/body with distinct ids
    let mut seen = std::collections::HashSet::new();
    for id in &ids {
        let m = h.mail.get_by_id(id).unwrap().unwrap();
        assert_eq!(m.body, "body");
        assert_eq!(m.subject, "s");
        assert!(seen.insert(m.id));
    }
}

#[test]
fn unread_ordering_survives_reopen() {
    let h = StateHarness::new();
    let mail = client(&h);
    spawn(&h, "sender", Capability::Builder);

    for i in 0..10 {
        mail.send(
            "sender",
            "receiver",
            "s",
            &format!("message {}", i),
            SendOptions::default(),
        )
        .unwrap();
    }

    let unread = h.mail.get_unread("receiver").unwrap();
    assert_eq!(unread.len(), 10);
    for pair in unread.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
    let bodies: Vec<&str> = unread.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies[0], "message 0");
    assert_eq!(bodies[9], "message 9");
}

#[test]
fn check_is_atomic_across_clients() {
    let h = StateHarness::new();
    let mail = client(&h);
    mail.send("a", "b", "s", "one", SendOptions::default()).unwrap();
    mail.send("a", "b", "s", "two", SendOptions::default()).unwrap();

    let first = mail.check("b").unwrap();
    assert_eq!(first.len(), 2);

    // A second client over the same database sees nothing unread
    let other = client(&h);
    assert!(other.check("b").unwrap().is_empty());
}

#[test]
fn protocol_payload_roundtrip_on_disk() {
    let h = StateHarness::new();
    let mail = client(&h);

    #[derive(serde::Serialize)]
    struct MergeReady {
        branch: String,
        files: Vec<String>,
    }

    let ids = mail
        .send_protocol(
            "builder-1",
            "merger-1",
            "ready",
            overstory::store::MessageType::MergeReady,
            &MergeReady {
                branch: "overstory/builder-1/task-abc".into(),
                files: vec!["a.ts".into()],
            },
        )
        .unwrap();

    let stored = h.mail.get_by_id(&ids[0]).unwrap().unwrap();
    let payload: serde_json::Value =
        serde_json::from_str(stored.payload.as_deref().unwrap()).unwrap();
    assert_eq!(payload["branch"], "overstory/builder-1/task-abc");
    assert_eq!(payload["files"][0], "a.ts");
}
