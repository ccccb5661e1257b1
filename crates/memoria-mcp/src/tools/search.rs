//! `memory_search` and `memory_match_triggers`.

use memoria_core::cache::normalize_for_matching;
use memoria_core::memory::{ContextType, ImportanceTier};
use memoria_core::search::SearchRequest;
use memoria_core::{CoreError, CoreRuntime, ErrorCode};
use serde_json::{json, Value};

use crate::envelope;

fn as_f32_vec(v: &Value) -> Option<Vec<f32>> {
    v.as_array()?.iter().map(|n| n.as_f64().map(|f| f as f32)).collect()
}

pub async fn memory_search(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let query = args.get("query").and_then(|v| v.as_str()).map(|s| s.to_string());
    let concepts: Vec<Vec<f32>> = args
        .get("concepts")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(as_f32_vec).collect())
        .unwrap_or_default();
    let query_embedding = args.get("queryEmbedding").and_then(as_f32_vec);

    let req = SearchRequest {
        query: query.clone(),
        concepts,
        spec_folder: args.get("specFolder").and_then(|v| v.as_str()).map(|s| s.to_string()),
        limit: args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize,
        min_similarity: args.get("minSimilarity").and_then(|v| v.as_f64()).unwrap_or(0.0),
        include_content: args.get("includeContent").and_then(|v| v.as_bool()).unwrap_or(false),
        tier: args.get("tier").and_then(|v| v.as_str()).map(ImportanceTier::parse),
        context_type: args.get("contextType").and_then(|v| v.as_str()).map(ContextType::parse),
        include_constitutional: args.get("includeConstitutional").and_then(|v| v.as_bool()).unwrap_or(true),
        expand_fuzzy: args.get("expandFuzzy").and_then(|v| v.as_bool()).unwrap_or(true),
    };

    match runtime.search(query_embedding.as_deref(), req).await {
        Ok(response) => {
            let results: Vec<Value> = response
                .results
                .iter()
                .map(|hit| {
                    json!({
                        "memory": hit.memory,
                        "score": hit.score,
                        "sources": hit.sources,
                        "sourceCount": hit.source_count,
                        "similarity": hit.similarity,
                        "isConstitutional": hit.is_constitutional,
                    })
                })
                .collect();
            let mut hints = Vec::new();
            if query_embedding.is_none() && query.is_some() {
                hints.push("no queryEmbedding was supplied; ranking used lexical search only".to_string());
            }
            let expanded_query = response.expanded_query.as_ref().map(|eq| {
                json!({
                    "expanded": eq.expanded,
                    "corrections": eq.corrections,
                    "acronymsFound": eq.acronyms_found.iter().map(|a| json!({"term": a.term, "expansions": a.expansions})).collect::<Vec<_>>(),
                })
            });
            let intent = response.intent.as_ref().map(|i| {
                json!({
                    "intent": i.intent.as_str(),
                    "confidence": i.confidence,
                    "fallback": i.fallback,
                })
            });
            let data = json!({
                "results": results,
                "expandedQuery": expanded_query,
                "intent": intent,
            });
            (envelope::success("memory_search", format!("found {} memories", results.len()), data, hints), false)
        }
        Err(err) => (envelope::error("memory_search", &err), true),
    }
}

/// Trigger phrases are matched by exact-normalized-string containment, not
/// the `TriggerRegexCache` (which compiles user-authored regex patterns for
/// a different matching mode) — see `cache::normalize_for_matching`.
pub async fn memory_match_triggers(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let Some(prompt) = args.get("prompt").and_then(|v| v.as_str()) else {
        let err = CoreError::new(ErrorCode::ParamMissing, "`prompt` is required");
        return (envelope::error("memory_match_triggers", &err), true);
    };
    let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;

    let normalized_prompt = normalize_for_matching(prompt);
    let memories = match runtime.storage.get_all_memories() {
        Ok(m) => m,
        Err(err) => return (envelope::error("memory_match_triggers", &err), true),
    };

    let mut matches: Vec<Value> = Vec::new();
    for memory in &memories {
        if memory.importance_tier == ImportanceTier::Deprecated {
            continue;
        }
        let matched: Vec<&String> = memory
            .trigger_phrases
            .iter()
            .filter(|phrase| normalized_prompt.contains(&normalize_for_matching(phrase)))
            .collect();
        if !matched.is_empty() {
            matches.push(json!({
                "memory": memory,
                "matchedTriggers": matched,
            }));
        }
        if matches.len() >= limit {
            break;
        }
    }

    let data = json!({"matches": matches});
    (envelope::success("memory_match_triggers", format!("{} memories matched", matches.len()), data, vec![]), false)
}
