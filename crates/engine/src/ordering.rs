//! Deterministic reservation ordering (spec §4.2): when a lease carries
//! more than one reservation, every lifecycle action applies them in a
//! single fixed order — network reservations last, everything else
//! first, ties broken by original (insertion) order. `blazar`'s
//! `_reservations_execution_ordered` runs start and end handlers
//! through the same ordering regardless of direction, so bring-up and
//! teardown here are the same sort, not mirror images of each other.

use leasemgr_common::model::{reservation_order_weight, Reservation};

/// Sorts `reservations` in place for **bring-up** (`on_start`).
pub fn sort_for_bring_up(reservations: &mut [Reservation]) {
    stable_sort_by_weight(reservations);
}

/// Sorts `reservations` in place for **teardown** (`on_end`). Same
/// order as bring-up: network last, ties broken by insertion order.
pub fn sort_for_teardown(reservations: &mut [Reservation]) {
    stable_sort_by_weight(reservations);
}

fn stable_sort_by_weight(reservations: &mut [Reservation]) {
    // `sort_by_key` is a stable sort, so reservations with equal weight
    // keep their relative order — this is what gives callers the
    // insertion-order tiebreak the spec calls for.
    reservations.sort_by_key(|r| reservation_order_weight(&r.resource_type));
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasemgr_common::model::ReservationStatus;
    use uuid::Uuid;

    fn reservation(resource_type: &str) -> Reservation {
        Reservation {
            id: Uuid::new_v4(),
            lease_id: Uuid::new_v4(),
            resource_type: resource_type.to_string(),
            resource_id: None,
            status: ReservationStatus::Pending,
            missing_resources: false,
            resources_changed: false,
            values: Default::default(),
        }
    }

    #[test]
    fn bring_up_puts_network_last() {
        let mut reservations =
            vec![reservation("network"), reservation("dummy.vm.plugin"), reservation("dummy.vm.plugin")];
        sort_for_bring_up(&mut reservations);
        assert_eq!(reservations.last().unwrap().resource_type, "network");
    }

    #[test]
    fn teardown_puts_network_last() {
        let mut reservations =
            vec![reservation("network"), reservation("dummy.vm.plugin"), reservation("dummy.vm.plugin")];
        sort_for_teardown(&mut reservations);
        assert_eq!(reservations.last().unwrap().resource_type, "network");
    }

    #[test]
    fn ties_preserve_insertion_order() {
        let a = reservation("dummy.vm.plugin");
        let b = reservation("dummy.vm.plugin");
        let a_id = a.id;
        let b_id = b.id;
        let mut reservations = vec![a, b];
        sort_for_bring_up(&mut reservations);
        assert_eq!(reservations[0].id, a_id);
        assert_eq!(reservations[1].id, b_id);
    }
}
