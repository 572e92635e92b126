// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The ordering engine: deterministic shuffling, serial partitioning, and
//! focus/skip filtering.
//!
//! Specs are shuffled in groups so a given seed always produces the same
//! order, on any machine, regardless of the order source files were
//! enumerated in. By default the shuffle granularity is the top-level
//! container — specs inside one container stay contiguous, which makes for
//! a saner debugging experience — while `randomize_all_specs` shuffles
//! every spec individually. Ordered containers are the exception: their
//! members stay contiguous and in source order under every granularity and
//! every seed.

use crate::{
    config::SuiteConfig,
    errors::ConfigError,
    node::{Node, NodeId, NodeKind},
    spec::{Spec, Specs},
    tree::TreeNode,
};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use regex::Regex;
use std::collections::HashMap;

/// The ordering engine's output: specs that may be distributed across
/// workers, and specs that must run serially on the designated worker.
#[derive(Clone, Debug)]
pub struct OrderedSpecs {
    /// Specs eligible for parallel distribution, in final order.
    pub parallelizable: Specs,
    /// Serial/ordered specs, run by exactly one worker after the parallel
    /// pool drains. Empty unless `parallel_total > 1`.
    pub serial: Specs,
}

/// Shuffles and partitions specs per the suite configuration.
pub fn order_specs(specs: Specs, config: &SuiteConfig) -> OrderedSpecs {
    let shuffled = shuffle_specs(specs, config);

    // With a single worker there is nothing to race against, so everything
    // stays parallel-eligible and in shuffled order.
    if config.parallel_total <= 1 {
        return OrderedSpecs {
            parallelizable: shuffled,
            serial: Specs::default(),
        };
    }

    let (serial, parallelizable): (Vec<Spec>, Vec<Spec>) = shuffled
        .0
        .into_iter()
        .partition(|spec| spec.is_serial_or_ordered());
    OrderedSpecs {
        parallelizable: Specs(parallelizable),
        serial: Specs(serial),
    }
}

/// The node whose id keys a spec's shuffle bucket.
///
/// Top-level container by default; the assertion itself under
/// `randomize_all_specs` — except that an ordered container always buckets
/// as a unit so its members cannot be torn apart.
fn shuffle_key_node<'a>(spec: &'a Spec, randomize_all: bool) -> &'a Node {
    if randomize_all {
        match spec.ordered_container() {
            Some(container) => container,
            None => spec.assertion_node(),
        }
    } else {
        spec.first_node_with_kind(NodeKind::CONTAINER_AND_ASSERTION)
            .expect("a spec chain always contains its assertion")
    }
}

/// Applies the seeded pseudo-random shuffle.
///
/// Specs are partitioned into buckets by key-node id, the buckets are
/// stable-sorted by the key node's code-location text (so the same
/// physical layout always yields the same pre-shuffle order, whatever
/// order files were loaded in), the bucket order is permuted with a
/// seeded RNG, and the buckets are flattened back preserving intra-bucket
/// order.
pub fn shuffle_specs(specs: Specs, config: &SuiteConfig) -> Specs {
    let mut buckets: Vec<(String, Vec<Spec>)> = Vec::new();
    let mut index_of: HashMap<NodeId, usize> = HashMap::new();

    for spec in specs.0 {
        let key = shuffle_key_node(&spec, config.randomize_all_specs);
        let (id, location) = (key.id, key.code_location.to_string());
        match index_of.get(&id) {
            Some(&idx) => buckets[idx].1.push(spec),
            None => {
                index_of.insert(id, buckets.len());
                buckets.push((location, vec![spec]));
            }
        }
    }

    // Ties in the location sort key fall back to encounter order; the
    // stable sort is load-bearing for determinism.
    buckets.sort_by(|a, b| a.0.cmp(&b.0));

    let mut rng = StdRng::seed_from_u64(config.random_seed);
    let mut order: Vec<usize> = (0..buckets.len()).collect();
    order.shuffle(&mut rng);

    let mut out = Vec::new();
    let mut buckets: Vec<Option<Vec<Spec>>> = buckets.into_iter().map(|(_, b)| Some(b)).collect();
    for idx in order {
        out.extend(
            buckets[idx]
                .take()
                .expect("each bucket index appears once in the permutation"),
        );
    }
    Specs(out)
}

/// Unmarks focus on containers that have a focused descendant.
///
/// Focusing a container and then focusing one spec inside it means "run
/// just that spec": the container's own focus mark would defeat the
/// narrowing, so it is dropped. Pending subtrees are left untouched.
pub fn apply_nested_focus_policy(tree: TreeNode) -> TreeNode {
    fn walk(mut tree: TreeNode) -> (TreeNode, bool) {
        if tree.node.marked_pending {
            return (tree, false);
        }
        let mut has_focused_descendant = false;
        tree.children = tree
            .children
            .into_iter()
            .map(|child| {
                let (child, focused) = walk(child);
                has_focused_descendant = has_focused_descendant || focused;
                child
            })
            .collect();
        tree.node.marked_focus = tree.node.marked_focus && !has_focused_descendant;
        let focused = tree.node.marked_focus || has_focused_descendant;
        (tree, focused)
    }

    walk(tree).0
}

fn join_patterns(patterns: &[String]) -> Result<Option<Regex>, ConfigError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let joined = patterns.join("|");
    Regex::new(&joined)
        .map(Some)
        .map_err(|source| ConfigError::InvalidFilterPattern {
            pattern: joined,
            source,
        })
}

/// Applies the focus/skip policy, setting the `skip` flag on filtered
/// specs. Returns the specs and whether any spec carried programmatic
/// focus (callers may want to report that, e.g. as a nonzero exit).
///
/// Policy, in order: pending specs are always skipped; programmatic focus
/// (when no focus/skip strings are configured) skips everything unfocused;
/// focus/skip strings match against `description + " " + spec text`;
/// focus/skip file patterns match against the assertion's `file:line`;
/// the label filter keeps only specs carrying a requested label.
pub fn apply_focus(
    mut specs: Specs,
    description: &str,
    config: &SuiteConfig,
) -> Result<(Specs, bool), ConfigError> {
    let focus_re = join_patterns(&config.focus_strings)?;
    let skip_re = join_patterns(&config.skip_strings)?;
    let focus_files_re = join_patterns(&config.focus_files)?;
    let skip_files_re = join_patterns(&config.skip_files)?;

    let use_programmatic_focus = focus_re.is_none() && skip_re.is_none();
    let has_programmatic_focus = use_programmatic_focus && specs.has_programmatic_focus();

    for spec in &mut specs.0 {
        if spec.nodes.has_node_marked_pending() {
            spec.skip = true;
            continue;
        }

        let text = format!("{description} {}", spec.text());
        let file_text = spec.assertion_node().code_location.to_string();

        let mut skip = false;
        if has_programmatic_focus {
            skip = skip || !spec.nodes.has_node_marked_focus();
        }
        if let Some(re) = &focus_re {
            skip = skip || !re.is_match(&text);
        }
        if let Some(re) = &skip_re {
            skip = skip || re.is_match(&text);
        }
        if let Some(re) = &focus_files_re {
            skip = skip || !re.is_match(&file_text);
        }
        if let Some(re) = &skip_files_re {
            skip = skip || re.is_match(&file_text);
        }
        if !config.label_filter.is_empty() {
            let labeled = spec
                .nodes
                .iter()
                .any(|node| node.labels.iter().any(|l| config.label_filter.contains(l)));
            skip = skip || !labeled;
        }

        // Only ever set the flag here; pending status set above must not
        // be un-skipped by a matching focus pattern.
        if skip {
            spec.skip = true;
        }
    }

    Ok((specs, has_programmatic_focus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{failer::SpecContext, node::Decorations, tree::TreeBuilder, tree::generate_specs};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn noop(_: &SpecContext) {}

    /// Three top-level containers with three specs each, plus one ordered
    /// container and one serial spec.
    fn sample_specs() -> Specs {
        let mut builder = TreeBuilder::new();
        for group in ["alpha", "beta", "gamma"] {
            builder
                .container(group, Decorations::none(), |b| {
                    for i in 1..=3 {
                        b.it(format!("spec {i}"), Decorations::none(), noop)?;
                    }
                    Ok(())
                })
                .expect("builds");
        }
        builder
            .container("ordered", Decorations::none().ordered(), |b| {
                for i in 1..=3 {
                    b.it(format!("step {i}"), Decorations::none(), noop)?;
                }
                Ok(())
            })
            .expect("builds");
        builder
            .it("standalone serial", Decorations::none().serial(), noop)
            .expect("builds");
        generate_specs(&builder.finish().tree).expect("generates")
    }

    fn texts(specs: &Specs) -> Vec<String> {
        specs.0.iter().map(|s| s.text()).collect()
    }

    #[test_case(0; "seed zero")]
    #[test_case(17; "default seed")]
    #[test_case(u64::MAX; "max seed")]
    fn same_seed_means_same_order(seed: u64) {
        let config = SuiteConfig::with_seed(seed);
        let once = shuffle_specs(sample_specs(), &config);
        let twice = shuffle_specs(sample_specs(), &config);
        assert_eq!(texts(&once), texts(&twice));
    }

    #[test]
    fn different_seeds_differ_with_high_probability() {
        let baseline = texts(&shuffle_specs(
            sample_specs(),
            &SuiteConfig::with_seed(0),
        ));
        let differing = (1..32u64)
            .filter(|&seed| {
                texts(&shuffle_specs(sample_specs(), &SuiteConfig::with_seed(seed))) != baseline
            })
            .count();
        assert!(differing > 0, "no seed in 1..32 changed the order");
    }

    #[test]
    fn shuffle_is_load_order_independent() {
        // The same physical layout presented in two enumeration orders
        // must shuffle the buckets into the same sequence. Intra-bucket
        // order follows encounter order, so compare bucket sequences.
        let forward = sample_specs();
        let mut reversed = sample_specs();
        reversed.0.reverse();

        let config = SuiteConfig::with_seed(7);
        let bucket = |t: &String| t.split(' ').next().unwrap_or_default().to_owned();
        let dedup = |v: Vec<String>| {
            let mut out: Vec<String> = Vec::new();
            for item in v {
                if out.last() != Some(&item) {
                    out.push(item);
                }
            }
            out
        };
        let a = dedup(texts(&shuffle_specs(forward, &config)).iter().map(bucket).collect());
        let b = dedup(texts(&shuffle_specs(reversed, &config)).iter().map(bucket).collect());
        assert_eq!(a, b);
    }

    #[test]
    fn grouped_shuffle_keeps_containers_contiguous() {
        for seed in 0..16 {
            let shuffled = shuffle_specs(sample_specs(), &SuiteConfig::with_seed(seed));
            let mut seen = Vec::new();
            for spec in &shuffled.0 {
                let group = spec.nodes[0].text.clone();
                if seen.last() != Some(&group) {
                    assert!(
                        !seen.contains(&group),
                        "seed {seed}: container `{group}` split apart"
                    );
                    seen.push(group);
                }
            }
        }
    }

    #[test]
    fn randomize_all_interleaves_containers_eventually() {
        let interleaved = (0..64u64).any(|seed| {
            let config = SuiteConfig {
                randomize_all_specs: true,
                ..SuiteConfig::with_seed(seed)
            };
            let shuffled = shuffle_specs(sample_specs(), &config);
            let mut seen: Vec<String> = Vec::new();
            for spec in &shuffled.0 {
                let group = spec.nodes[0].text.clone();
                if seen.last() != Some(&group) && seen.contains(&group) {
                    return true;
                }
                if seen.last() != Some(&group) {
                    seen.push(group);
                }
            }
            false
        });
        assert!(interleaved, "no seed in 0..64 interleaved container specs");
    }

    #[test]
    fn ordered_container_stays_in_source_order_for_every_seed() {
        for seed in 0..32 {
            for randomize_all in [false, true] {
                let config = SuiteConfig {
                    randomize_all_specs: randomize_all,
                    ..SuiteConfig::with_seed(seed)
                };
                let shuffled = shuffle_specs(sample_specs(), &config);
                let steps: Vec<String> = shuffled
                    .0
                    .iter()
                    .filter(|s| s.nodes[0].text == "ordered")
                    .map(|s| s.text())
                    .collect();
                assert_eq!(
                    steps,
                    vec!["ordered step 1", "ordered step 2", "ordered step 3"],
                    "seed {seed}, randomize_all {randomize_all}"
                );
                // Contiguity: the positions of the ordered specs must be
                // consecutive.
                let positions: Vec<usize> = shuffled
                    .0
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.nodes[0].text == "ordered")
                    .map(|(i, _)| i)
                    .collect();
                for pair in positions.windows(2) {
                    assert_eq!(pair[0] + 1, pair[1]);
                }
            }
        }
    }

    #[test]
    fn empty_spec_list_yields_two_empty_groups() {
        let config = SuiteConfig {
            parallel_total: 2,
            parallel_index: 1,
            coordinator_address: Some("unused".to_owned()),
            ..SuiteConfig::default()
        };
        let ordered = order_specs(Specs::default(), &config);
        assert!(ordered.parallelizable.0.is_empty());
        assert!(ordered.serial.0.is_empty());
    }

    #[test]
    fn serial_specs_are_partitioned_only_when_parallel() {
        let single = order_specs(sample_specs(), &SuiteConfig::with_seed(3));
        assert!(single.serial.0.is_empty());
        assert_eq!(single.parallelizable.0.len(), 13);

        let config = SuiteConfig {
            parallel_total: 3,
            parallel_index: 1,
            coordinator_address: Some("unused".to_owned()),
            ..SuiteConfig::with_seed(3)
        };
        let parallel = order_specs(sample_specs(), &config);
        assert_eq!(parallel.serial.0.len(), 4); // 3 ordered + 1 serial
        assert_eq!(parallel.parallelizable.0.len(), 9);
    }

    #[test]
    fn programmatic_focus_skips_unfocused_specs() {
        let mut builder = TreeBuilder::new();
        builder
            .container("group", Decorations::none(), |b| {
                b.it("focused", Decorations::none().focus(), noop)?;
                b.it("plain", Decorations::none(), noop)
            })
            .expect("builds");
        let specs = generate_specs(&builder.finish().tree).expect("generates");
        let (specs, has_focus) =
            apply_focus(specs, "suite", &SuiteConfig::default()).expect("applies");
        assert!(has_focus);
        let skipped: Vec<bool> = specs.0.iter().map(|s| s.skip).collect();
        assert_eq!(skipped, vec![false, true]);
    }

    #[test]
    fn nested_focus_unmarks_the_container() {
        let mut builder = TreeBuilder::new();
        builder
            .container("debugging", Decorations::none().focus(), |b| {
                b.it("works a", Decorations::none(), noop)?;
                b.it("broken", Decorations::none().focus(), noop)?;
                b.it("works b", Decorations::none(), noop)
            })
            .expect("builds");
        let tree = apply_nested_focus_policy(builder.finish().tree);
        let specs = generate_specs(&tree).expect("generates");
        let (specs, _) = apply_focus(specs, "suite", &SuiteConfig::default()).expect("applies");
        let runnable: Vec<String> = specs
            .0
            .iter()
            .filter(|s| !s.skip)
            .map(|s| s.text())
            .collect();
        assert_eq!(runnable, vec!["debugging broken"]);
    }

    #[test]
    fn focus_and_skip_strings_filter_by_text() {
        let config = SuiteConfig {
            focus_strings: vec!["alpha".to_owned()],
            skip_strings: vec!["spec 2".to_owned()],
            ..SuiteConfig::default()
        };
        let (specs, has_focus) =
            apply_focus(sample_specs(), "suite", &config).expect("applies");
        assert!(!has_focus);
        let runnable: Vec<String> = specs
            .0
            .iter()
            .filter(|s| !s.skip)
            .map(|s| s.text())
            .collect();
        assert_eq!(runnable, vec!["alpha spec 1", "alpha spec 3"]);
    }

    #[test]
    fn label_filter_keeps_only_labeled_specs() {
        let mut builder = TreeBuilder::new();
        builder
            .it("tagged", Decorations::none().label("slow"), noop)
            .expect("builds");
        builder.it("untagged", Decorations::none(), noop).expect("builds");
        let specs = generate_specs(&builder.finish().tree).expect("generates");
        let config = SuiteConfig {
            label_filter: vec!["slow".to_owned()],
            ..SuiteConfig::default()
        };
        let (specs, _) = apply_focus(specs, "suite", &config).expect("applies");
        let skipped: Vec<bool> = specs.0.iter().map(|s| s.skip).collect();
        assert_eq!(skipped, vec![false, true]);
    }
}
