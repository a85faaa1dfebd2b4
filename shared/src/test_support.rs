use crate::model::{DeviceId, IdempotencyKey, ItemId, MutationItem, Operation, PayloadHash, Priority, UnixTimeMs};
use crate::state::ItemState;

pub(crate) fn sample_item(id: &str, priority: Priority, created_at: u64) -> MutationItem {
    let payload = format!("{{\"id\":\"{id}\"}}").into_bytes();
    MutationItem {
        id: ItemId::new(id).unwrap(),
        idempotency_key: IdempotencyKey::new(format!("key-{id}")).unwrap(),
        operation: Operation::Create,
        entity_type: "mood_entry".into(),
        record_key: None,
        payload_hash: PayloadHash::of(&payload),
        payload,
        base_payload: None,
        priority,
        local_version: 1,
        state: ItemState::Queued,
        retry_count: 0,
        max_retries: 5,
        conflict_count: 0,
        attempt_count: 0,
        created_at: UnixTimeMs(created_at),
        updated_at: UnixTimeMs(created_at),
        scheduled_at: UnixTimeMs(created_at),
        device_id: DeviceId::new("device-a").unwrap(),
        last_error: None,
        pending_edit: None,
    }
}
