use protocol::{AppResult, ClientEvent, ServerEvent, is_valid_room_code};

use crate::store::{JoinOutcome, MemberOutbox, RoomStore};

pub fn dispatch_client_event(
    store: &RoomStore,
    member_id: &str,
    outbox: &MemberOutbox,
    event: ClientEvent,
) -> AppResult<()> {
    match event {
        ClientEvent::JoinRoom { code } => {
            if !is_valid_room_code(code.as_str()) {
                tracing::warn!(event = "join_room_code_invalid", member_id, code);
                return Ok(());
            }
            if store.join(code.as_str(), member_id, outbox.clone()) == JoinOutcome::Full {
                let _ = outbox.send(ServerEvent::RoomFull);
            }
            Ok(())
        }
        ClientEvent::Signal { code, data } => {
            store.forward(code.as_str(), member_id, ServerEvent::Signal { data })
        }
        ClientEvent::RelayChunk { code, b64, meta } => {
            store.forward(code.as_str(), member_id, ServerEvent::RelayChunk { b64, meta })
        }
        ClientEvent::RelayMeta { code, meta } => {
            store.forward(code.as_str(), member_id, ServerEvent::RelayMeta { meta })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn join_room_full_should_notify_only_the_joiner() {
        let store = RoomStore::new();
        let (tx_1, _rx_1) = mpsc::unbounded_channel();
        let (tx_2, _rx_2) = mpsc::unbounded_channel();
        let (tx_3, mut rx_3) = mpsc::unbounded_channel();

        store.join("000123", "member-1", tx_1);
        store.join("000123", "member-2", tx_2);

        dispatch_client_event(
            &store,
            "member-3",
            &tx_3,
            ClientEvent::JoinRoom {
                code: "000123".to_string(),
            },
        )
        .expect("dispatch join");

        assert_eq!(rx_3.try_recv().expect("room full event"), ServerEvent::RoomFull);
    }

    #[test]
    fn malformed_join_code_should_be_dropped() {
        let store = RoomStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch_client_event(
            &store,
            "member-1",
            &tx,
            ClientEvent::JoinRoom {
                code: "12ab".to_string(),
            },
        )
        .expect("dispatch malformed join");

        assert!(!store.exists("12ab"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn relay_events_should_reach_the_other_member() {
        let store = RoomStore::new();
        let (tx_1, _rx_1) = mpsc::unbounded_channel();
        let (tx_2, mut rx_2) = mpsc::unbounded_channel();

        store.join("000123", "member-1", tx_1.clone());
        store.join("000123", "member-2", tx_2);
        while rx_2.try_recv().is_ok() {}

        dispatch_client_event(
            &store,
            "member-1",
            &tx_1,
            ClientEvent::RelayChunk {
                code: "000123".to_string(),
                b64: "AAECAw==".to_string(),
                meta: serde_json::json!({"offset": 0}),
            },
        )
        .expect("dispatch relay chunk");

        match rx_2.try_recv().expect("relayed chunk") {
            ServerEvent::RelayChunk { b64, meta } => {
                assert_eq!(b64, "AAECAw==");
                assert_eq!(meta["offset"], 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
