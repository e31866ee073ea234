//! Property tests for tokenizer stability and edit arithmetic.

use std::collections::BTreeSet;

use proptest::prelude::*;

use readalong::edit::{apply_range_cut, apply_skip_cut};
use readalong::normalize::normalize;
use readalong::{SyncEntry, SyncTable};

fn no_rewrite(_: &str) -> Option<String> {
    None
}

proptest! {
    /// Byte-identical input yields byte-identical HTML and token ids.
    #[test]
    fn normalizer_is_deterministic(text in "[ a-zA-Z0-9,.;]{0,200}") {
        let xhtml = format!("<body><p>{text}</p></body>");
        let a = normalize(&xhtml, "ch.xhtml", &no_rewrite);
        let b = normalize(&xhtml, "ch.xhtml", &no_rewrite);
        prop_assert_eq!(a.html, b.html);
        prop_assert_eq!(&a.tokens, &b.tokens);
        for (i, token) in a.tokens.iter().enumerate() {
            let expected = format!("w{i}");
            prop_assert_eq!(token.id.as_str(), expected.as_str());
        }
    }

    /// Tokens partition the word characters: concatenated surfaces equal the
    /// input with separators removed.
    #[test]
    fn tokens_cover_word_characters(text in "[ a-z0-9'!-]{0,120}") {
        let xhtml = format!("<body><p>{text}</p></body>");
        let result = normalize(&xhtml, "ch.xhtml", &no_rewrite);
        let from_tokens: String = result.tokens.iter().map(|t| t.surface.as_str()).collect();
        let from_input: String = text.chars().filter(|c| c.is_alphanumeric()).collect();
        prop_assert_eq!(from_tokens, from_input);
    }
}

/// A random well-formed sync table: per-token gap then width, cumulative.
fn arb_sync_table() -> impl Strategy<Value = (SyncTable, f64)> {
    prop::collection::vec((0.0f64..0.5, 0.1f64..0.8), 1..20).prop_map(|steps| {
        let mut entries = Vec::with_capacity(steps.len());
        let mut cursor = 0.0;
        for (i, (gap, width)) in steps.iter().enumerate() {
            let begin = cursor + gap;
            let end = begin + width;
            entries.push(SyncEntry::timed(format!("w{i}"), begin, end));
            cursor = end;
        }
        let duration = cursor + 0.25;
        (SyncTable::new(entries), duration)
    })
}

proptest! {
    /// After a range cut, the survivors are exactly the entries that did not
    /// overlap the cut, and entries past the cut shift left by its length.
    #[test]
    fn range_cut_arithmetic((table, duration) in arb_sync_table(),
                            a in 0.0f64..5.0, len in 0.01f64..2.0) {
        let b = (a + len).min(duration);
        prop_assume!(a < b);
        let out = apply_range_cut(&table, a, b);

        for (before, after) in table.entries.iter().zip(&out.entries) {
            let (begin, end) = before.interval().unwrap();
            let overlapped = begin < b && end > a;
            if overlapped {
                prop_assert!(after.skipped);
                prop_assert!(after.interval().is_none());
            } else if begin >= b {
                let (nb, ne) = after.interval().unwrap();
                prop_assert!((nb - (begin - (b - a))).abs() < 1e-9);
                prop_assert!((ne - (end - (b - a))).abs() < 1e-9);
            } else {
                prop_assert_eq!(after.interval(), Some((begin, end)));
            }
        }
    }

    /// A skip cut removes exactly the named tokens' mass and shifts every
    /// retained entry by the removed mass before it.
    #[test]
    fn skip_cut_arithmetic((table, _duration) in arb_sync_table(),
                           picks in prop::collection::vec(any::<prop::sample::Index>(), 1..5)) {
        let ids: BTreeSet<String> = picks
            .iter()
            .map(|index| table.entries[index.index(table.entries.len())].token_id.clone())
            .collect();
        let (out, removed) = apply_skip_cut(&table, &ids);

        let removed_total: f64 = removed.iter().map(|(b, e)| e - b).sum();
        let expected_total: f64 = table
            .entries
            .iter()
            .filter(|e| ids.contains(&e.token_id))
            .filter_map(|e| e.interval())
            .map(|(b, e)| e - b)
            .sum();
        prop_assert!((removed_total - expected_total).abs() < 1e-9);

        for (before, after) in table.entries.iter().zip(&out.entries) {
            let (begin, end) = before.interval().unwrap();
            if ids.contains(&before.token_id) {
                prop_assert!(after.skipped);
            } else {
                let mass_before: f64 = removed
                    .iter()
                    .map(|&(rb, re)| (re.min(begin) - rb).max(0.0))
                    .sum();
                let (nb, ne) = after.interval().unwrap();
                prop_assert!((nb - (begin - mass_before)).abs() < 1e-9);
                prop_assert!((ne - (end - mass_before)).abs() < 1e-9);
            }
        }

        // non-skipped set afterwards = prior set minus the cut ids
        let after_ids: BTreeSet<&str> = out
            .entries
            .iter()
            .filter(|e| !e.skipped)
            .map(|e| e.token_id.as_str())
            .collect();
        for entry in &table.entries {
            let expect_present = !ids.contains(&entry.token_id);
            prop_assert_eq!(after_ids.contains(entry.token_id.as_str()), expect_present);
        }
    }
}
