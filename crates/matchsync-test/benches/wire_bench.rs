//! Benchmarks for the sync wire format

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use matchsync_core::{UserId, ValidationStatus, VarValue};
use matchsync_wire::{Envelope, PresenceValue, SharedValue, SyncMessage, UserValue};

fn mixed_envelope() -> Envelope {
    let mut env = Envelope::new();
    for i in 0..32 {
        env.shared.push(SharedValue {
            key: format!("shared-{}", i),
            value: VarValue::Int(i),
            lock_version: i as u64 + 1,
            status: ValidationStatus::Validated,
        });
        env.user.push(UserValue {
            key: "name".into(),
            user_id: UserId::new(format!("user-{}", i)),
            value: VarValue::String(format!("player {}", i)),
            lock_version: 1,
            status: ValidationStatus::Pending,
        });
        env.presence.push(PresenceValue {
            collection: "pos".into(),
            user_id: UserId::new(format!("user-{}", i)),
            value: VarValue::Float(i as f64 * 0.5),
            lock_version: 3,
            status: ValidationStatus::Validated,
        });
    }
    env
}

fn bench_envelope_encode(c: &mut Criterion) {
    let message = SyncMessage::Envelope(mixed_envelope());
    c.bench_function("envelope_encode_96", |b| {
        b.iter(|| black_box(&message).to_bytes())
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let bytes = SyncMessage::Envelope(mixed_envelope()).to_bytes().unwrap();
    c.bench_function("envelope_decode_96", |b| {
        b.iter(|| SyncMessage::from_bytes(black_box(&bytes)))
    });
}

criterion_group!(benches, bench_envelope_encode, bench_envelope_decode);
criterion_main!(benches);
