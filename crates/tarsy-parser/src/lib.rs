//! ReAct output parser (C7): turns one LLM completion into its `Thought` /
//! `Action` / `Action Input` / `Final Answer` sections.
//!
//! Implemented as an explicit line-oriented state machine rather than a
//! single regex pass, since headers can repeat (a later one overwrites the
//! earlier one's buffer), `Final Answer` can appear mid-line, and the model
//! sometimes hallucinates its own `Observation:` line — all of which need
//! different handling per line, not just pattern matching on the whole text.

use std::sync::OnceLock;

use regex::Regex;
use tarsy_core::ToolCallRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Section {
    Thought,
    Action,
    ActionInput,
    Observation,
    FinalAnswer,
}

fn header_regex() -> &'static [(Section, Regex)] {
    static CELL: OnceLock<Vec<(Section, Regex)>> = OnceLock::new();
    CELL.get_or_init(|| {
        vec![
            // `Thought` with no colon only counts as a header when the colon
            // form isn't present; the bare-word variant is handled separately
            // in `match_header` since it must be the *entire* stripped line.
            (Section::Thought, Regex::new(r"(?i)^thought\s*:\s*(.*)$").unwrap()),
            (Section::ActionInput, Regex::new(r"(?i)^action\s*input\s*:?\s*(.*)$").unwrap()),
            (Section::Action, Regex::new(r"(?i)^action\s*:?\s*(.*)$").unwrap()),
            (Section::Observation, Regex::new(r"(?i)^observation\s*:?\s*(.*)$").unwrap()),
            (Section::FinalAnswer, Regex::new(r"(?i)^final\s*answer\s*:?\s*(.*)$").unwrap()),
        ]
    })
}

/// Matches `Final Answer:` anywhere in a line, not just at the start, so a
/// model that writes `I'm done. Final Answer: looks healthy` is still picked
/// up instead of the whole line being swallowed by whatever section is open.
fn mid_line_final_answer() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"(?i)final\s*answer\s*:?\s*").unwrap())
}

/// Lines that look like the model hallucinating its own tool result rather
/// than waiting for one, e.g. `[Based on the previous output, ...]`.
fn fake_content_marker() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"(?i)^\[based\s+on\b").unwrap())
}

/// `Observation:` lines the model legitimately writes as part of a
/// correction reminder we fed it back, rather than a hallucinated result —
/// these must not stop parsing.
fn is_legitimate_observation_continuation(rest: &str) -> bool {
    let lower = rest.trim().to_ascii_lowercase();
    lower.starts_with("please specify") || lower.starts_with("error in reasoning")
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedReact {
    pub thought: Option<String>,
    pub action: Option<String>,
    pub action_input: Option<serde_json::Value>,
    pub final_answer: Option<String>,
    /// Populated when `action` + `action_input` are both present: per
    /// `Action`/`Action Input` precedence over `Final Answer`, a tool call
    /// wins the turn even if the model also wrote a final answer.
    pub tool_call: Option<ToolCallRecord>,
    pub tool_call_error: Option<String>,
    /// `true` once an `Observation:` header was seen in the model's own
    /// output; everything from that line on is dropped as hallucinated.
    pub stopped_on_hallucinated_observation: bool,
}

/// The three shapes a parsed completion can take, per §4.6's contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseType {
    FinalAnswer,
    ThoughtAction,
    Malformed,
}

impl ParsedReact {
    /// A tool call beats a final answer whenever both are present.
    pub fn wants_tool_call(&self) -> bool {
        self.tool_call.is_some()
    }

    /// Classifies the parse per the precedence rule: a complete action wins
    /// over a final answer; an action with a parse error and no final
    /// answer to fall back on is malformed; anything else with neither is
    /// also malformed.
    pub fn response_type(&self) -> ResponseType {
        if self.tool_call.is_some() {
            ResponseType::ThoughtAction
        } else if self.final_answer.is_some() {
            ResponseType::FinalAnswer
        } else {
            ResponseType::Malformed
        }
    }
}

pub fn parse(text: &str) -> ParsedReact {
    let mut buffers: std::collections::HashMap<Section, String> = std::collections::HashMap::new();
    let mut current: Option<Section> = None;
    let mut stopped_on_hallucinated_observation = false;

    for raw_line in text.lines() {
        let trimmed = raw_line.trim();

        if fake_content_marker().is_match(trimmed) {
            stopped_on_hallucinated_observation = true;
            break;
        }

        if let Some((section, rest)) = match_header(trimmed) {
            if section == Section::Observation {
                if is_legitimate_observation_continuation(rest) {
                    // A correction reminder we fed back, echoed by the model;
                    // not a real tool result, but not a reason to stop either.
                    current = None;
                    continue;
                }
                // The model is narrating a tool result it never received.
                stopped_on_hallucinated_observation = true;
                break;
            }
            set_header_value(&mut buffers, section, rest.to_string());
            current = Some(section);
            continue;
        }

        if let Some(section) = mid_line_final_answer_section(trimmed) {
            let mat = mid_line_final_answer().find(trimmed).unwrap();
            let before = &trimmed[..mat.start()];
            if let Some(current_section) = current {
                append_line(&mut buffers, current_section, before.trim_end());
            }
            let after_header = &trimmed[mat.end()..];
            set_header_value(&mut buffers, section, after_header.to_string());
            current = Some(section);
            continue;
        }

        if let Some(section) = current {
            append_line(&mut buffers, section, raw_line);
        }
    }

    let thought = buffers.remove(&Section::Thought).map(|s| s.trim().to_string());
    let action = buffers.remove(&Section::Action).map(|s| s.trim().to_string());
    let action_input_raw = buffers.remove(&Section::ActionInput).map(|s| s.trim().to_string());
    let final_answer = buffers.remove(&Section::FinalAnswer).map(|s| s.trim().to_string());

    let action_input = action_input_raw.as_deref().map(parse_action_input);

    let (tool_call, tool_call_error) = match (&action, &action_input) {
        (Some(action_text), Some(input)) if !action_text.is_empty() => {
            match convert_tool_call(action_text, input.clone()) {
                Ok(call) => (Some(call), None),
                Err(e) => (None, Some(e)),
            }
        }
        _ => (None, None),
    };

    ParsedReact {
        thought,
        action,
        action_input,
        final_answer,
        tool_call,
        tool_call_error,
        stopped_on_hallucinated_observation,
    }
}

fn match_header(line: &str) -> Option<(Section, &str)> {
    // Bare `Thought` (no colon) is a header only when it is the *entire*
    // stripped line — otherwise it's the start of a narrative sentence like
    // "Thought about it for a while and decided...".
    if line.eq_ignore_ascii_case("thought") {
        return Some((Section::Thought, ""));
    }
    for (section, regex) in header_regex() {
        if let Some(caps) = regex.captures(line) {
            let rest = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            return Some((*section, rest));
        }
    }
    None
}

/// Whether `line` contains a mid-line `Final Answer:` occurrence that counts
/// as a header: it must not be at the start of the line (that's handled by
/// [`match_header`]) and must be immediately preceded, modulo whitespace, by
/// sentence-ending punctuation.
fn mid_line_final_answer_section(line: &str) -> Option<Section> {
    let mat = mid_line_final_answer().find(line)?;
    if mat.start() == 0 {
        return None;
    }
    let before = line[..mat.start()].trim_end();
    if before.ends_with(['.', '!', '?']) {
        Some(Section::FinalAnswer)
    } else {
        None
    }
}

/// Records a header's value in `buffers`. Every section is last-wins except
/// `Final Answer`, where the first occurrence wins — a model that restates
/// its answer after wrapping up shouldn't get to silently retract the first
/// one.
fn set_header_value(buffers: &mut std::collections::HashMap<Section, String>, section: Section, value: String) {
    if section == Section::FinalAnswer {
        buffers.entry(section).or_insert(value);
    } else {
        buffers.insert(section, value);
    }
}

fn append_line(buffers: &mut std::collections::HashMap<Section, String>, section: Section, line: &str) {
    let entry = buffers.entry(section).or_default();
    if !entry.is_empty() {
        entry.push('\n');
    }
    entry.push_str(line);
}

/// Exactly one `.` is required between server and tool names; anything else
/// (zero dots, or more than one) is a malformed action line.
fn convert_tool_call(action_text: &str, arguments: serde_json::Value) -> Result<ToolCallRecord, String> {
    let mut parts = action_text.splitn(2, '.');
    let server = parts.next().unwrap_or("");
    let Some(tool) = parts.next() else {
        return Err(format!("action '{action_text}' has no '.' separating server from tool"));
    };
    if tool.contains('.') {
        return Err(format!("action '{action_text}' has more than one '.'"));
    }
    ToolCallRecord::try_from((server, tool, arguments))
        .map_err(|e| e.message)
}

/// Action Input parsing cascade: valid JSON first, then `key: value`/`key=value`
/// comma-separated pairs, and finally plain text wrapped as `{"input": ...}`.
fn parse_action_input(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        return match value {
            serde_json::Value::Object(_) => value,
            scalar_or_array => serde_json::json!({ "input": scalar_or_array }),
        };
    }
    if let Some(pairs) = parse_key_value_pairs(raw) {
        return pairs;
    }
    serde_json::json!({ "input": raw })
}

/// Splits on commas *or* newlines so both `a: 1, b: 2` and a multi-line
/// block like:
/// ```text
/// namespace: prod
/// apiVersion: v1
/// ```
/// parse the same way: one `key: value`/`key = value` pair per segment.
fn parse_key_value_pairs(raw: &str) -> Option<serde_json::Value> {
    let mut map = serde_json::Map::new();
    let mut found_any = false;
    for segment in raw.split(|c| c == ',' || c == '\n') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let split_point = segment.find(':').or_else(|| segment.find('='));
        let Some(idx) = split_point else { return None };
        let key = segment[..idx].trim();
        let value = segment[idx + 1..].trim();
        if key.is_empty() {
            return None;
        }
        map.insert(key.to_string(), coerce_value(value));
        found_any = true;
    }
    if found_any {
        Some(serde_json::Value::Object(map))
    } else {
        None
    }
}

/// Coerces a bare scalar string into bool/null/int/float when it
/// unambiguously looks like one, otherwise leaves it as a string.
fn coerce_value(raw: &str) -> serde_json::Value {
    let unquoted = raw.trim_matches('"');
    match unquoted.to_ascii_lowercase().as_str() {
        "true" => return serde_json::Value::Bool(true),
        "false" => return serde_json::Value::Bool(false),
        "null" | "none" => return serde_json::Value::Null,
        _ => {}
    }
    if let Ok(i) = unquoted.parse::<i64>() {
        return serde_json::json!(i);
    }
    if let Ok(f) = unquoted.parse::<f64>() {
        return serde_json::json!(f);
    }
    serde_json::Value::String(unquoted.to_string())
}

/// Formats a tool result for re-insertion into the conversation as an
/// `Observation:` turn.
pub fn format_observation(result: &serde_json::Value) -> String {
    match result {
        serde_json::Value::String(s) => format!("Observation: {s}"),
        other => format!(
            "Observation: {}",
            serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
        ),
    }
}

/// One tool invocation's outcome, keyed by the server/tool it ran against.
pub struct ObservationEntry {
    pub server: String,
    pub tool: String,
    pub outcome: Result<serde_json::Value, String>,
}

/// Renders a whole turn's worth of tool results as the `Observation:` block
/// fed back to the model: one `server.tool:\n<body>` per success, one
/// `server.tool error: <msg>` per failure, joined with blank lines. Empty
/// input yields a fixed "no data" sentence rather than an empty string, so
/// the next prompt never silently drops the observation turn.
pub fn format_observations(entries: &[ObservationEntry]) -> String {
    if entries.is_empty() {
        return "No data returned from the action.".to_string();
    }
    entries
        .iter()
        .map(|entry| match &entry.outcome {
            Ok(value) => {
                let body = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
                };
                format!("{}.{}:\n{}", entry.server, entry.tool, body)
            }
            Err(message) => format!("{}.{} error: {}", entry.server, entry.tool, message),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thought_action_and_action_input() {
        let text = "Thought: I should check pod status\nAction: kubernetes.get_pods\nAction Input: {\"namespace\": \"default\"}";
        let parsed = parse(text);
        assert_eq!(parsed.thought.as_deref(), Some("I should check pod status"));
        assert_eq!(parsed.action.as_deref(), Some("kubernetes.get_pods"));
        assert!(parsed.wants_tool_call());
        let call = parsed.tool_call.unwrap();
        assert_eq!(call.server, "kubernetes");
        assert_eq!(call.tool, "get_pods");
    }

    #[test]
    fn thought_header_without_colon_is_still_recognised() {
        let parsed = parse("Thought\nchecking things");
        assert_eq!(parsed.thought.as_deref(), Some("checking things"));
    }

    #[test]
    fn action_and_action_input_win_over_a_final_answer_in_the_same_turn() {
        let text = "Action: kubernetes.get_pods\nAction Input: {}\nFinal Answer: all good";
        let parsed = parse(text);
        assert!(parsed.wants_tool_call());
        assert_eq!(parsed.final_answer.as_deref(), Some("all good"));
    }

    #[test]
    fn final_answer_mid_line_is_detected() {
        let parsed = parse("I'm done thinking. Final Answer: the cluster is healthy");
        assert_eq!(parsed.final_answer.as_deref(), Some("the cluster is healthy"));
    }

    #[test]
    fn a_later_duplicate_header_overwrites_the_earlier_one() {
        let text = "Thought: first idea\nThought: actually, second idea";
        let parsed = parse(text);
        assert_eq!(parsed.thought.as_deref(), Some("actually, second idea"));
    }

    #[test]
    fn a_later_duplicate_final_answer_header_does_not_overwrite_the_first() {
        let text = "Final Answer: the cluster is healthy\nFinal Answer: actually, it's not";
        let parsed = parse(text);
        assert_eq!(parsed.final_answer.as_deref(), Some("the cluster is healthy"));
    }

    #[test]
    fn hallucinated_observation_stops_parsing() {
        let text = "Action: kubernetes.get_pods\nAction Input: {}\nObservation: 3 pods running\nFinal Answer: fine";
        let parsed = parse(text);
        assert!(parsed.stopped_on_hallucinated_observation);
        assert_eq!(parsed.final_answer, None);
    }

    #[test]
    fn action_with_no_dot_is_a_malformed_tool_call() {
        let text = "Action: get_pods\nAction Input: {}";
        let parsed = parse(text);
        assert!(parsed.tool_call.is_none());
        assert!(parsed.tool_call_error.is_some());
    }

    #[test]
    fn action_input_falls_back_to_key_value_pairs_then_plain_text() {
        let parsed = parse("Action Input: namespace: default, replicas: 3, dry_run: true");
        let value = parsed.action_input.unwrap();
        assert_eq!(value["namespace"], "default");
        assert_eq!(value["replicas"], 3);
        assert_eq!(value["dry_run"], true);

        let parsed = parse("Action Input: just plain text here");
        assert_eq!(parsed.action_input.unwrap()["input"], "just plain text here");
    }

    #[test]
    fn formats_string_and_structured_observations_differently() {
        assert_eq!(format_observation(&serde_json::json!("ok")), "Observation: ok");
        assert!(format_observation(&serde_json::json!({"a": 1})).starts_with("Observation: {"));
    }

    #[test]
    fn a_narrative_sentence_starting_with_thought_is_not_a_header() {
        let parsed = parse("Thought about it and decided to check pods first\nFinal Answer: done");
        assert_eq!(parsed.thought, None);
        assert_eq!(parsed.final_answer.as_deref(), Some("done"));
    }

    #[test]
    fn a_legitimate_observation_continuation_does_not_stop_parsing() {
        let text = "Action: k8s.get_pods\nAction Input: {}\nObservation: Please specify a namespace\nFinal Answer: ok";
        let parsed = parse(text);
        assert!(!parsed.stopped_on_hallucinated_observation);
        assert_eq!(parsed.final_answer.as_deref(), Some("ok"));

        let text2 = "Thought: retry\nObservation: Error in reasoning, please continue\nFinal Answer: ok";
        let parsed2 = parse(text2);
        assert!(!parsed2.stopped_on_hallucinated_observation);
    }

    #[test]
    fn a_fake_content_marker_stops_parsing() {
        let text = "Thought: checking\n[Based on the previous run, pods are healthy]\nFinal Answer: fine";
        let parsed = parse(text);
        assert!(parsed.stopped_on_hallucinated_observation);
        assert_eq!(parsed.final_answer, None);
    }

    #[test]
    fn json_scalar_action_input_is_wrapped_but_object_is_used_as_is() {
        let parsed = parse("Action Input: \"just a string\"");
        assert_eq!(parsed.action_input.unwrap()["input"], "just a string");

        let parsed = parse("Action Input: [1, 2, 3]");
        assert_eq!(parsed.action_input.unwrap()["input"], serde_json::json!([1, 2, 3]));

        let parsed = parse("Action Input: {\"namespace\": \"prod\"}");
        assert_eq!(parsed.action_input.unwrap()["namespace"], "prod");
    }

    #[test]
    fn newline_separated_key_value_pairs_parse_like_a_yaml_block() {
        let parsed = parse("Action Input: namespace: prod\napiVersion: v1\nreplicas: 2");
        let value = parsed.action_input.unwrap();
        assert_eq!(value["namespace"], "prod");
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["replicas"], 2);
    }

    #[test]
    fn format_observations_renders_successes_and_failures_and_empty_case() {
        assert_eq!(format_observations(&[]), "No data returned from the action.");

        let entries = vec![
            ObservationEntry {
                server: "kubectl".into(),
                tool: "get_pods".into(),
                outcome: Ok(serde_json::json!("3 pods running")),
            },
            ObservationEntry {
                server: "kubectl".into(),
                tool: "get_services".into(),
                outcome: Err("connection refused".into()),
            },
        ];
        let rendered = format_observations(&entries);
        assert!(rendered.contains("kubectl.get_pods:\n3 pods running"));
        assert!(rendered.contains("kubectl.get_services error: connection refused"));
    }

    #[test]
    fn response_type_follows_the_precedence_rule() {
        let thought_action = parse("Action: k8s.get_pods\nAction Input: {}\nFinal Answer: also present");
        assert_eq!(thought_action.response_type(), ResponseType::ThoughtAction);

        let final_answer = parse("Thought: ok\nFinal Answer: all good");
        assert_eq!(final_answer.response_type(), ResponseType::FinalAnswer);

        let malformed = parse("Thought: hmm, not sure what to do next");
        assert_eq!(malformed.response_type(), ResponseType::Malformed);

        let malformed_action = parse("Action: get_pods\nAction Input: {}");
        assert_eq!(malformed_action.response_type(), ResponseType::Malformed);
    }
}
