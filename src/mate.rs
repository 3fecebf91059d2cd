//! In-batch mate resolution.
//!
//! Implicit mate storage lets the decoder reconstruct a downstream mate's
//! position, flags and template size from the upstream record alone. That is
//! only safe when every segment of the template landed in the same batch and
//! the stamped template sizes agree with the positions. This module links
//! fragments of a batch into chains and detaches every chain that cannot be
//! reconstructed.
//!
//! Records live in a flat arena; chains are linked by arena index.

use crate::record::{CramRecord, NO_NEXT_FRAGMENT};
use bstr::BString;
use std::collections::HashMap;

/// Links mates within a batch and detaches unreconstructable chains.
///
/// On non-coordinate-sorted batches every record is detached outright.
/// Otherwise three passes run: chain linking per read name (primary and
/// secondary streams kept separate), chain validation against the insert-size
/// rule, and detachment of fragments whose partners never arrived.
pub fn resolve_mates(records: &mut [CramRecord], coordinate_sorted: bool) {
    if !coordinate_sorted {
        for record in records.iter_mut() {
            record.detached = true;
        }
        return;
    }

    let mut primary_mates: HashMap<BString, usize> = HashMap::new();
    let mut secondary_mates: HashMap<BString, usize> = HashMap::new();

    // pass 1: link fragments into chains, keyed by read name
    for i in 0..records.len() {
        if !records[i].multi_fragment {
            clear_linkage(&mut records[i]);
            continue;
        }

        let mate_map =
            if records[i].secondary { &mut secondary_mates } else { &mut primary_mates };
        let name = records[i].read_name.clone();
        match mate_map.get(&name).copied() {
            None => {
                mate_map.insert(name, i);
            }
            Some(mate) => {
                let mut prev = mate;
                while let Some(next) = records[prev].next {
                    prev = next;
                }
                records[prev].records_to_next_fragment =
                    records[i].index - records[prev].index - 1;
                records[prev].next = Some(i);
                records[i].previous = Some(prev);
                records[prev].has_mate_downstream = true;
                records[i].has_mate_downstream = false;
                records[i].detached = false;
                records[prev].detached = false;
            }
        }
    }

    // pass 2: detach chains the decoder could not replay
    for head in 0..records.len() {
        if records[head].next.is_none() || records[head].previous.is_some() {
            continue;
        }
        let mut tail = head;
        while let Some(next) = records[tail].next {
            tail = next;
        }

        if records[head].first_segment && records[tail].last_segment {
            let template_length = compute_insert_size(&records[head], &records[tail]);
            if records[head].template_size == template_length {
                let mut cursor = records[head].next.unwrap_or(head);
                while let Some(next) = records[cursor].next {
                    if records[cursor].template_size != -template_length {
                        break;
                    }
                    cursor = next;
                }
                if records[cursor].template_size != -template_length {
                    detach(records, head);
                }
            } else {
                detach(records, head);
            }
        } else {
            detach(records, head);
        }
    }

    // pass 3: fragments whose partner never arrived in this batch
    for map in [&primary_mates, &secondary_mates] {
        for &i in map.values() {
            if records[i].next.is_some() {
                continue;
            }
            clear_linkage(&mut records[i]);
        }
    }
}

/// Marks every record of a chain as detached, walking forward from `head`.
///
/// Chain pointers stay in place; the container encoder stores detached
/// records with explicit mate fields regardless.
pub fn detach(records: &mut [CramRecord], head: usize) {
    let mut cursor = Some(head);
    while let Some(i) = cursor {
        records[i].detached = true;
        records[i].has_mate_downstream = false;
        records[i].records_to_next_fragment = NO_NEXT_FRAGMENT;
        cursor = records[i].next;
    }
}

fn clear_linkage(record: &mut CramRecord) {
    record.detached = true;
    record.has_mate_downstream = false;
    record.records_to_next_fragment = NO_NEXT_FRAGMENT;
    record.next = None;
    record.previous = None;
}

/// Computes the expected template length between the two outer segments:
/// the signed 5'-to-5' distance with a one-base adjustment toward the
/// rightmost end. Returns 0 when either end is unmapped or the ends map to
/// different sequences.
#[must_use]
pub fn compute_insert_size(first_end: &CramRecord, second_end: &CramRecord) -> i32 {
    if first_end.segment_unmapped || second_end.segment_unmapped {
        return 0;
    }
    if first_end.sequence_id != second_end.sequence_id {
        return 0;
    }

    let first_five_prime = if first_end.negative_strand {
        first_end.alignment_end
    } else {
        first_end.alignment_start
    } as i64;
    let second_five_prime = if second_end.negative_strand {
        second_end.alignment_end
    } else {
        second_end.alignment_start
    } as i64;

    let adjustment: i64 = if second_five_prime >= first_five_prime { 1 } else { -1 };
    i32::try_from(second_five_prime - first_five_prime + adjustment).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a mapped record with the linkage-relevant fields set.
    #[allow(clippy::too_many_arguments)]
    fn record(
        index: i32,
        name: &str,
        start: usize,
        end: usize,
        template_size: i32,
        first: bool,
        last: bool,
        negative: bool,
    ) -> CramRecord {
        CramRecord {
            index,
            sequence_id: Some(0),
            alignment_start: start,
            alignment_end: end,
            read_name: BString::from(name),
            template_size,
            multi_fragment: true,
            first_segment: first,
            last_segment: last,
            negative_strand: negative,
            ..CramRecord::default()
        }
    }

    fn fragment(index: i32, name: &str, start: usize) -> CramRecord {
        CramRecord {
            index,
            sequence_id: Some(0),
            alignment_start: start,
            alignment_end: start + 49,
            read_name: BString::from(name),
            ..CramRecord::default()
        }
    }

    #[test]
    fn test_insert_size_fr_pair() {
        let head = record(1, "q", 100, 149, 150, true, false, false);
        let tail = record(2, "q", 200, 249, -150, false, true, true);
        assert_eq!(compute_insert_size(&head, &tail), 150);
    }

    #[test]
    fn test_insert_size_unmapped_or_cross_reference() {
        let head = record(1, "q", 100, 149, 0, true, false, false);
        let mut tail = record(2, "q", 200, 249, 0, false, true, true);

        tail.segment_unmapped = true;
        assert_eq!(compute_insert_size(&head, &tail), 0);

        tail.segment_unmapped = false;
        tail.sequence_id = Some(1);
        assert_eq!(compute_insert_size(&head, &tail), 0);
    }

    #[test]
    fn test_non_coordinate_detaches_everything() {
        let mut records = vec![
            record(1, "q", 100, 149, 150, true, false, false),
            record(2, "q", 200, 249, -150, false, true, true),
        ];
        resolve_mates(&mut records, false);
        assert!(records.iter().all(|r| r.detached));
    }

    #[test]
    fn test_single_fragments_detached() {
        let mut records = vec![fragment(1, "a", 100), fragment(2, "b", 200)];
        resolve_mates(&mut records, true);

        for r in &records {
            assert!(r.detached);
            assert!(!r.has_mate_downstream);
            assert_eq!(r.records_to_next_fragment, NO_NEXT_FRAGMENT);
            assert!(r.next.is_none());
            assert!(r.previous.is_none());
        }
    }

    #[test]
    fn test_reconstructable_pair_stays_attached() {
        let mut records = vec![
            record(1, "q", 100, 149, 150, true, false, false),
            record(2, "q", 200, 249, -150, false, true, true),
        ];
        resolve_mates(&mut records, true);

        assert!(!records[0].detached);
        assert!(!records[1].detached);
        assert!(records[0].has_mate_downstream);
        assert!(!records[1].has_mate_downstream);
        assert_eq!(records[0].records_to_next_fragment, 0);
        assert_eq!(records[0].next, Some(1));
        assert_eq!(records[1].previous, Some(0));
    }

    #[test]
    fn test_intervening_record_counted() {
        let mut records = vec![
            record(1, "q", 100, 149, 150, true, false, false),
            fragment(2, "other", 120),
            record(3, "q", 200, 249, -150, false, true, true),
        ];
        resolve_mates(&mut records, true);

        assert!(!records[0].detached);
        assert_eq!(records[0].records_to_next_fragment, 1);
        assert!(records[1].detached);
    }

    #[test]
    fn test_inconsistent_template_size_detaches() {
        // stamped TLEN disagrees with the computed insert size
        let mut records = vec![
            record(1, "q", 100, 149, 500, true, false, false),
            record(2, "q", 200, 249, -500, false, true, true),
        ];
        resolve_mates(&mut records, true);

        assert!(records[0].detached);
        assert!(records[1].detached);
        assert!(!records[0].has_mate_downstream);
        assert_eq!(records[0].records_to_next_fragment, NO_NEXT_FRAGMENT);
    }

    #[test]
    fn test_wrong_tail_template_size_detaches() {
        let mut records = vec![
            record(1, "q", 100, 149, 150, true, false, false),
            record(2, "q", 200, 249, 150, false, true, true),
        ];
        resolve_mates(&mut records, true);

        assert!(records[0].detached);
        assert!(records[1].detached);
    }

    #[test]
    fn test_missing_segment_flags_detach() {
        // neither end marked first/last
        let mut records = vec![
            record(1, "q", 100, 149, 150, false, false, false),
            record(2, "q", 200, 249, -150, false, false, true),
        ];
        resolve_mates(&mut records, true);
        assert!(records[0].detached);
        assert!(records[1].detached);
    }

    #[test]
    fn test_lonely_multi_fragment_detached() {
        // mate never arrives in this batch
        let mut records = vec![record(1, "q", 100, 149, 150, true, false, false)];
        resolve_mates(&mut records, true);

        assert!(records[0].detached);
        assert!(!records[0].has_mate_downstream);
        assert_eq!(records[0].records_to_next_fragment, NO_NEXT_FRAGMENT);
    }

    #[test]
    fn test_secondary_stream_links_separately() {
        let mut primary_head = record(1, "q", 100, 149, 150, true, false, false);
        primary_head.secondary = false;
        let mut secondary_head = record(2, "q", 105, 154, 150, true, false, false);
        secondary_head.secondary = true;
        let mut primary_tail = record(3, "q", 200, 249, -150, false, true, true);
        primary_tail.secondary = false;
        let mut secondary_tail = record(4, "q", 205, 254, -150, false, true, true);
        secondary_tail.secondary = true;

        let mut records = vec![primary_head, secondary_head, primary_tail, secondary_tail];
        resolve_mates(&mut records, true);

        // primary chain: 0 -> 2; secondary chain: 1 -> 3
        assert_eq!(records[0].next, Some(2));
        assert_eq!(records[1].next, Some(3));
        assert_eq!(records[2].previous, Some(0));
        assert_eq!(records[3].previous, Some(1));
        assert!(!records[0].detached);
        assert!(!records[1].detached);
    }

    #[test]
    fn test_three_segment_chain_interior_validated() {
        // head +150, interior -150, tail -150: reconstructable
        let mut records = vec![
            record(1, "q", 100, 149, 150, true, false, false),
            record(2, "q", 150, 199, -150, false, false, false),
            record(3, "q", 200, 249, -150, false, true, true),
        ];
        resolve_mates(&mut records, true);
        assert!(!records[0].detached);
        assert!(!records[1].detached);
        assert!(!records[2].detached);
        assert_eq!(records[0].next, Some(1));
        assert_eq!(records[1].next, Some(2));

        // interior disagrees: whole chain detaches
        let mut records = vec![
            record(1, "q", 100, 149, 150, true, false, false),
            record(2, "q", 150, 199, 75, false, false, false),
            record(3, "q", 200, 249, -150, false, true, true),
        ];
        resolve_mates(&mut records, true);
        assert!(records.iter().all(|r| r.detached));
    }
}
