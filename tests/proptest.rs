//! Property-based tests for the decoder and the merge.

use proptest::prelude::*;

use wechat_chat_export::DecodeError;
use wechat_chat_export::extra::{FieldConvention, decode_fields, encode_varint, read_varint};
use wechat_chat_export::merge::KWayMerge;

fn arb_sorted_sources() -> impl Strategy<Value = Vec<Vec<i64>>> {
    prop::collection::vec(prop::collection::vec(-1000i64..1000, 0..20), 0..6).prop_map(
        |mut sources| {
            for s in &mut sources {
                s.sort();
            }
            sources
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every u64 survives encode then decode, using all bytes written
    #[test]
    fn varint_round_trip(value in any::<u64>()) {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        prop_assert!(buf.len() <= 10);
        let (decoded, next) = read_varint(&buf, 0).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(next, buf.len());
    }

    /// Canonical byte sequences survive decode then encode unchanged
    #[test]
    fn varint_bytes_round_trip(bytes in prop::collection::vec(any::<u8>(), 1..12)) {
        if let Ok((value, next)) = read_varint(&bytes, 0) {
            let consumed = &bytes[..next];
            // a trailing 0x00 continuation is a padded, non-canonical form
            prop_assume!(next == 1 || consumed[next - 1] != 0);
            let mut again = Vec::new();
            encode_varint(value, &mut again);
            prop_assert_eq!(again.as_slice(), consumed);
        }
    }

    /// Cutting a varint short is always reported at its start offset
    #[test]
    fn truncated_varint_fails(value in 128u64.., cut in 1usize..10) {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        let cut = cut.min(buf.len() - 1);
        let result = read_varint(&buf[..cut], 0);
        prop_assert_eq!(result, Err(DecodeError::MalformedVarint { offset: 0 }));
    }

    /// Arbitrary bytes never panic the decoder
    #[test]
    fn decoder_never_panics(blob in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = decode_fields(&blob);
        let _ = FieldConvention::flat().decode(Some(&blob));
        let _ = FieldConvention::keyed().decode(Some(&blob));
    }

    /// Merge output is sorted and holds exactly the input items
    #[test]
    fn merge_is_sorted_union(sources in arb_sorted_sources()) {
        let mut expected: Vec<i64> = sources.iter().flatten().copied().collect();
        expected.sort();

        let iters = sources.into_iter().map(Vec::into_iter).collect();
        let merged: Vec<i64> = KWayMerge::new(iters, |x: &i64| *x).collect();

        prop_assert!(merged.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(merged, expected);
    }
}
