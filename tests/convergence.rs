//! Cross-replica convergence at the document store level.

use ledgersync::events::{DeltaEnvelope, Origin};
use ledgersync::record::Record;
use ledgersync::store::crdt::ActorId;
use ledgersync::store::RecordStore;

fn rec(invoice: &str) -> Record {
    Record {
        invoice_no: invoice.to_string(),
        customer: "Acme".into(),
        ..Default::default()
    }
}

/// Collect the Local envelopes a store emitted while running `f`.
fn emitted(store: &mut RecordStore, f: impl FnOnce(&mut RecordStore)) -> Vec<DeltaEnvelope> {
    let mut rx = store.changes();
    f(store);
    let mut out = Vec::new();
    while let Ok(env) = rx.try_recv() {
        out.push(env);
    }
    out
}

#[test]
fn replicas_converge_regardless_of_delivery_order() {
    let mut a = RecordStore::new(ActorId(1));
    let mut b = RecordStore::new(ActorId(2));
    let mut c = RecordStore::new(ActorId(3));

    let from_a = emitted(&mut a, |s| {
        s.append(rec("INV-1"));
        s.append(rec("INV-2"));
    });
    let from_b = emitted(&mut b, |s| {
        s.append(rec("INV-3"));
        s.remove_by_key("INV-3");
    });
    let from_c = emitted(&mut c, |s| {
        s.append(rec("INV-4"));
    });

    // Deliver in a different interleaving to each replica, with repeats.
    let all: Vec<&DeltaEnvelope> = from_a.iter().chain(&from_b).chain(&from_c).collect();
    for env in &all {
        let relabeled = DeltaEnvelope::new(env.payload.clone(), Origin::Peer);
        a.apply_remote(&relabeled).unwrap();
    }
    for env in all.iter().rev() {
        let relabeled = DeltaEnvelope::new(env.payload.clone(), Origin::CloudRelay);
        b.apply_remote(&relabeled).unwrap();
        b.apply_remote(&relabeled).unwrap();
    }
    for env in &all {
        let relabeled = DeltaEnvelope::new(env.payload.clone(), Origin::Peer);
        c.apply_remote(&relabeled).unwrap();
    }

    let names = |s: &RecordStore| -> Vec<String> {
        s.records().into_iter().map(|r| r.invoice_no).collect()
    };
    assert_eq!(names(&a), names(&b));
    assert_eq!(names(&b), names(&c));
    // Dot order: clock first, then actor, so the two clock-1 inserts from
    // actors 1 and 3 sort ahead of actor 1's clock-2 insert.
    assert_eq!(names(&a), vec!["INV-1", "INV-4", "INV-2"]);
}

#[test]
fn full_state_exchange_is_enough_to_converge() {
    let mut a = RecordStore::new(ActorId(1));
    let mut b = RecordStore::new(ActorId(2));
    a.append(rec("INV-1"));
    b.append(rec("INV-2"));

    let state_a = DeltaEnvelope::new(a.encode_full_state(), Origin::CloudRelay);
    let state_b = DeltaEnvelope::new(b.encode_full_state(), Origin::CloudRelay);
    assert!(a.apply_remote(&state_b).unwrap());
    assert!(b.apply_remote(&state_a).unwrap());

    // Second round trip carries nothing new in either direction.
    let again_a = DeltaEnvelope::new(a.encode_full_state(), Origin::CloudRelay);
    assert!(!b.apply_remote(&again_a).unwrap());
    assert_eq!(a.records(), b.records());
}
