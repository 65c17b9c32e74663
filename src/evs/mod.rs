// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Extended virtual synchrony: view agreement and ordered delivery.

mod consensus;
mod input_map;
pub(crate) mod message;
mod node;
pub(crate) mod proto;

pub use self::proto::EvsState;
pub(crate) use self::proto::{Effect, EvsProto};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        types::{Order, Uuid, ViewType},
    };
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::time::Instant;

    fn proto(uuid: Uuid) -> EvsProto {
        EvsProto::new(&Config::new(), uuid, 0, 32 * 1024, None, Instant::now()).unwrap()
    }

    // Feed every broadcast from `from` into `to` and vice versa until
    // the pair quiesces, returning the non-send effects of `to`.
    fn pump(from: &mut EvsProto, to: &mut EvsProto, now: Instant) -> Vec<Effect> {
        let mut out = Vec::new();
        for round in 0.. {
            assert!(round < 1000, "message exchange did not quiesce");
            let mut progress = false;
            for effect in from.drain_effects() {
                if let Effect::Send(bytes) = effect {
                    to.handle_up(bytes, now).unwrap();
                    progress = true;
                }
            }
            for effect in to.drain_effects() {
                if let Effect::Send(bytes) = effect {
                    from.handle_up(bytes, now).unwrap();
                    progress = true;
                } else {
                    out.push(effect);
                }
            }
            if !progress {
                break;
            }
        }
        out
    }

    #[test]
    fn single_node_boot_reaches_operational() {
        let now = Instant::now();
        let uuid = Uuid::generate();
        let mut evs = proto(uuid);
        evs.open(now).unwrap();
        assert_eq!(evs.state(), EvsState::Joining);

        evs.shift_to(EvsState::Gather, false, now).unwrap();
        evs.send_join(true, now).unwrap();
        assert_eq!(evs.state(), EvsState::Operational);

        let effects = evs.drain_effects();
        let views: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::DeliverView(view) => Some(view.clone()),
                _ => None,
            })
            .collect();
        // Trans view for the singleton start, then the first reg view.
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].view_type(), ViewType::Trans);
        assert_eq!(views[1].view_type(), ViewType::Reg);
        assert!(views[1].is_member(uuid));
        assert_eq!(views[1].members().len(), 1);
    }

    #[test]
    fn singleton_safe_message_self_delivers() {
        let now = Instant::now();
        let uuid = Uuid::generate();
        let mut evs = proto(uuid);
        evs.open(now).unwrap();
        evs.shift_to(EvsState::Gather, false, now).unwrap();
        evs.send_join(true, now).unwrap();
        let _ = evs.drain_effects();

        evs.handle_down(Bytes::from_static(b"payload"), Order::Safe, now)
            .unwrap();
        let effects = evs.drain_effects();
        let delivered = effects
            .iter()
            .find_map(|e| match e {
                Effect::Deliver {
                    source,
                    order,
                    payload,
                    ..
                } => Some((*source, *order, payload.clone())),
                _ => None,
            })
            .expect("safe message delivered to self");
        assert_eq!(delivered.0, uuid);
        assert_eq!(delivered.1, Order::Safe);
        assert_eq!(delivered.2, Bytes::from_static(b"payload"));
    }

    // Boot two singleton groups and merge them by letting their joins
    // cross. Retrans timers are driven to flush the commit/install gap
    // exchange.
    fn converge_pair(
        a: &mut EvsProto,
        b: &mut EvsProto,
        mut now: Instant,
    ) -> Instant {
        for evs in vec![&mut *a, &mut *b] {
            evs.open(now).unwrap();
            evs.shift_to(EvsState::Gather, false, now).unwrap();
            evs.send_join(true, now).unwrap();
            let _ = evs.drain_effects();
        }
        assert_eq!(a.state(), EvsState::Operational);
        assert_eq!(b.state(), EvsState::Operational);

        a.send_join(true, now).unwrap();
        for _ in 0..8 {
            let _ = pump(a, b, now);
            let _ = pump(b, a, now);
            if a.state() == EvsState::Operational
                && b.state() == EvsState::Operational
                && a.current_view().members().len() == 2
                && b.current_view().members().len() == 2
            {
                return now;
            }
            now += std::time::Duration::from_millis(1100);
            a.handle_timers(now).unwrap();
            b.handle_timers(now).unwrap();
        }
        panic!("nodes failed to converge");
    }

    #[test]
    fn two_nodes_converge_on_common_view() {
        let now = Instant::now();
        let a_uuid = Uuid::generate();
        let b_uuid = Uuid::generate();
        let mut a = proto(a_uuid);
        let mut b = proto(b_uuid);
        let _ = converge_pair(&mut a, &mut b, now);

        assert_eq!(a.current_view().members().len(), 2);
        assert_eq!(b.current_view().id(), a.current_view().id());
        assert!(a.current_view().is_member(b_uuid));
        assert!(b.current_view().is_member(a_uuid));
        // The merged view id exceeds both singleton views.
        assert!(a.current_view().id().seq() >= 1);
    }

    #[test]
    fn fifo_regression_from_member_is_fatal() {
        let now = Instant::now();
        let a_uuid = Uuid::generate();
        let b_uuid = Uuid::generate();
        let mut a = proto(a_uuid);
        let mut b = proto(b_uuid);
        let now = converge_pair(&mut a, &mut b, now);
        assert!(a.current_view().is_member(b_uuid));
        let _ = a.drain_effects();
        let _ = b.drain_effects();

        // A user message from b, replayed verbatim: the overlay fifo
        // seq regresses, which from a current-view member is fatal.
        b.handle_down(Bytes::from_static(b"x"), Order::Safe, now)
            .unwrap();
        let sends: Vec<Bytes> = b
            .drain_effects()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Send(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        let user_frame = sends.last().cloned().unwrap();
        a.handle_up(user_frame.clone(), now).unwrap();
        let _ = a.drain_effects();
        assert_matches!(
            a.handle_up(user_frame, now),
            Err(crate::Error::Unrecoverable(_))
        );
    }
}
