//! Concurrent rule-set replacement: evaluations racing a `load` must see
//! either the old set or the new one, never a mix.

use refract_common::{RuleId, Stage};
use refract_rules::{
    Action, Condition, EvalContext, Match, RewriteAction, Rule, RuleEngine, RuleMode, RuleSet,
    UrlMatchMode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn match_all_rule(id: &str) -> Rule {
    Rule {
        id: RuleId::new(id),
        name: id.to_string(),
        priority: 0,
        mode: RuleMode::Aggregate,
        stage: None,
        matcher: Match {
            all_of: vec![Condition::Url {
                mode: UrlMatchMode::Prefix,
                pattern: "https://".to_string(),
            }],
            any_of: vec![],
            none_of: vec![],
        },
        actions: vec![Action::Rewrite(RewriteAction::default())],
    }
}

fn set_with(ids: &[&str]) -> RuleSet {
    RuleSet {
        version: "1.0".to_string(),
        rules: ids.iter().map(|id| match_all_rule(id)).collect(),
    }
}

#[test]
fn test_concurrent_swap_is_atomic() {
    let engine = Arc::new(RuleEngine::new());
    engine.load(set_with(&["old-1", "old-2"])).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let ctx = EvalContext {
                url: "https://a.test/".to_string(),
                method: "GET".to_string(),
                ..EvalContext::default()
            };
            while !stop.load(Ordering::Relaxed) {
                let matched = engine.eval_for_stage(&ctx, Stage::Request);
                let ids: Vec<&str> = matched.iter().map(|r| r.id.as_str()).collect();
                assert!(
                    ids == ["old-1", "old-2"] || ids == ["new-1"],
                    "observed torn rule set: {:?}",
                    ids
                );
            }
        }));
    }

    let writer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for round in 0..200 {
                if round % 2 == 0 {
                    engine.load(set_with(&["new-1"])).unwrap();
                } else {
                    engine.load(set_with(&["old-1", "old-2"])).unwrap();
                }
            }
        })
    };

    writer.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
}
