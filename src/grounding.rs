//! Local action grounding for UI-TARS style replies.
//!
//! Turns `click(point='<point>500 300</point>')` and friends into
//! [`PrimitiveAction`]s in screen pixels. Model coordinates live on a
//! `0..1000` grid and are scaled to the captured display.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::planner::ActionGrounder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrimitiveAction {
    Click { x: i64, y: i64, button: MouseButton },
    DoubleClick { x: i64, y: i64 },
    Drag { from: (i64, i64), to: (i64, i64) },
    Hotkey { keys: Vec<String> },
    Type { text: String },
    Scroll { x: i64, y: i64, direction: ScrollDirection, amount: i64 },
    Wait { ms: u64 },
}

/// A parsed `name(key='value', ...)` call. Positional arguments get an
/// empty key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub name: String,
    pub args: Vec<(String, String)>,
}

impl Call {
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Named `key`, else the first positional argument.
    pub fn arg_or_first(&self, key: &str) -> Option<&str> {
        self.arg(key)
            .or_else(|| self.args.iter().find(|(k, _)| k.is_empty()).map(|(_, v)| v.as_str()))
    }
}

/// Splits `a(...) b(...)` / newline / `;` separated calls, honouring quotes.
pub fn split_calls(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start: Option<usize> = None;

    for (i, c) in s.char_indices() {
        if start.is_none() {
            if c.is_whitespace() || c == ';' || c == ',' {
                continue;
            }
            start = Some(i);
        }
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(st) = start.take() {
                        out.push(s[st..=i].trim());
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(st) = start {
        let rest = s[st..].trim();
        if !rest.is_empty() {
            out.push(rest);
        }
    }
    out
}

pub fn parse_call(s: &str) -> Result<Call, AgentError> {
    let s = s.trim();
    let open = s
        .find('(')
        .ok_or_else(|| AgentError::Grounding(format!("not a call: {s}")))?;
    if !s.ends_with(')') {
        return Err(AgentError::Grounding(format!("unterminated call: {s}")));
    }
    let name = s[..open].trim().to_string();
    let inner: Vec<char> = s[open + 1..s.len() - 1].chars().collect();

    let mut args = Vec::new();
    let mut i = 0;
    while i < inner.len() {
        while i < inner.len() && (inner[i].is_whitespace() || inner[i] == ',') {
            i += 1;
        }
        if i >= inner.len() {
            break;
        }
        // key, if the next `=` comes before any quote or comma
        let mut key = String::new();
        let mut j = i;
        while j < inner.len() && !matches!(inner[j], '=' | '\'' | '"' | ',') {
            j += 1;
        }
        if j < inner.len() && inner[j] == '=' {
            key = inner[i..j].iter().collect::<String>().trim().to_string();
            i = j + 1;
            while i < inner.len() && inner[i].is_whitespace() {
                i += 1;
            }
        }
        let mut value = String::new();
        if i < inner.len() && matches!(inner[i], '\'' | '"') {
            let q = inner[i];
            i += 1;
            while i < inner.len() && inner[i] != q {
                if inner[i] == '\\' && i + 1 < inner.len() {
                    i += 1;
                    value.push(match inner[i] {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    value.push(inner[i]);
                }
                i += 1;
            }
            i += 1;
        } else {
            while i < inner.len() && inner[i] != ',' {
                value.push(inner[i]);
                i += 1;
            }
            value = value.trim().to_string();
        }
        args.push((key, value));
    }

    Ok(Call { name, args })
}

/// Reads `<point>x y</point>`, `(x,y)`, `x y` or a `[x1,y1,x2,y2]` box (its
/// centre).
pub fn parse_point(raw: &str) -> Option<(f64, f64)> {
    let cleaned: String = raw
        .replace("<point>", " ")
        .replace("</point>", " ")
        .replace("<|box_start|>", " ")
        .replace("<|box_end|>", " ")
        .chars()
        .map(|c| if c.is_ascii_digit() || c == '.' || c == '-' { c } else { ' ' })
        .collect();
    let nums: Vec<f64> = cleaned
        .split_whitespace()
        .filter_map(|t| t.parse::<f64>().ok())
        .collect();
    match nums.as_slice() {
        [x, y] => Some((*x, *y)),
        [x1, y1, x2, y2] => Some(((x1 + x2) / 2.0, (y1 + y2) / 2.0)),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct UiTarsGrounder {
    /// Side of the model's relative coordinate grid; `None` means the model
    /// already speaks pixels.
    pub grid: Option<f64>,
    pub scroll_amount: i64,
    pub wait_ms: u64,
}

impl Default for UiTarsGrounder {
    fn default() -> Self {
        Self { grid: Some(1000.0), scroll_amount: 5, wait_ms: 5000 }
    }
}

impl UiTarsGrounder {
    fn to_pixels(&self, (x, y): (f64, f64), screen: (u32, u32)) -> (i64, i64) {
        match self.grid {
            Some(g) if g > 0.0 => (
                (x * screen.0 as f64 / g).round() as i64,
                (y * screen.1 as f64 / g).round() as i64,
            ),
            _ => (x.round() as i64, y.round() as i64),
        }
    }

    fn point(&self, call: &Call, keys: &[&str], screen: (u32, u32)) -> Result<(i64, i64), AgentError> {
        let raw = keys
            .iter()
            .find_map(|k| call.arg(k))
            .or_else(|| call.arg_or_first(""))
            .ok_or_else(|| AgentError::Grounding(format!("{}: missing point", call.name)))?;
        let p = parse_point(raw)
            .ok_or_else(|| AgentError::Grounding(format!("{}: bad point {raw:?}", call.name)))?;
        Ok(self.to_pixels(p, screen))
    }

    pub fn ground_call(&self, call: &Call, screen: (u32, u32)) -> Result<Vec<PrimitiveAction>, AgentError> {
        const POINT: &[&str] = &["point", "start_box"];
        let a = match call.name.as_str() {
            "click" | "left_single" => {
                let (x, y) = self.point(call, POINT, screen)?;
                vec![PrimitiveAction::Click { x, y, button: MouseButton::Left }]
            }
            "left_double" | "double_click" => {
                let (x, y) = self.point(call, POINT, screen)?;
                vec![PrimitiveAction::DoubleClick { x, y }]
            }
            "right_single" | "right_click" => {
                let (x, y) = self.point(call, POINT, screen)?;
                vec![PrimitiveAction::Click { x, y, button: MouseButton::Right }]
            }
            "middle_single" => {
                let (x, y) = self.point(call, POINT, screen)?;
                vec![PrimitiveAction::Click { x, y, button: MouseButton::Middle }]
            }
            "drag" | "select" => {
                let from = self.point(call, &["start_point", "start_box"], screen)?;
                let to = self.point(call, &["end_point", "end_box"], screen)?;
                vec![PrimitiveAction::Drag { from, to }]
            }
            "hotkey" | "press" => {
                let raw = call
                    .arg_or_first("key")
                    .ok_or_else(|| AgentError::Grounding("hotkey: missing key".into()))?;
                let keys: Vec<String> = raw.split_whitespace().map(|k| k.to_lowercase()).collect();
                if keys.is_empty() {
                    return Err(AgentError::Grounding("hotkey: empty key".into()));
                }
                vec![PrimitiveAction::Hotkey { keys }]
            }
            "type" => {
                let content = call.arg_or_first("content").unwrap_or_default();
                // trailing newline means "submit"
                match content.strip_suffix('\n') {
                    Some(text) => vec![
                        PrimitiveAction::Type { text: text.to_string() },
                        PrimitiveAction::Hotkey { keys: vec!["enter".into()] },
                    ],
                    None => vec![PrimitiveAction::Type { text: content.to_string() }],
                }
            }
            "scroll" => {
                let (x, y) = self
                    .point(call, POINT, screen)
                    .unwrap_or((screen.0 as i64 / 2, screen.1 as i64 / 2));
                let direction = match call.arg("direction").map(|d| d.trim().to_lowercase()) {
                    Some(d) if d == "up" => ScrollDirection::Up,
                    Some(d) if d == "left" => ScrollDirection::Left,
                    Some(d) if d == "right" => ScrollDirection::Right,
                    _ => ScrollDirection::Down,
                };
                vec![PrimitiveAction::Scroll { x, y, direction, amount: self.scroll_amount }]
            }
            "wait" => vec![PrimitiveAction::Wait { ms: self.wait_ms }],
            other => return Err(AgentError::Grounding(format!("unsupported action {other}"))),
        };
        Ok(a)
    }
}

/// Tolerates a stray leading `Action:` marker on an already extracted action.
fn strip_marker(action: &str) -> &str {
    let action = action.trim();
    action.strip_prefix("Action:").unwrap_or(action)
}

#[async_trait]
impl ActionGrounder for UiTarsGrounder {
    async fn ground(&self, action: &str, screen: (u32, u32)) -> Result<Vec<PrimitiveAction>, AgentError> {
        let mut out = Vec::new();
        for raw in split_calls(strip_marker(action)) {
            let call = parse_call(raw)?;
            out.extend(self.ground_call(&call, screen)?);
        }
        if out.is_empty() {
            return Err(AgentError::Grounding("no action found in model output".into()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCREEN: (u32, u32) = (1920, 1080);

    #[test]
    fn parses_quoted_kwargs_with_escapes() {
        let c = parse_call(r#"type(content='it\'s done\n')"#).unwrap();
        assert_eq!(c.name, "type");
        assert_eq!(c.arg("content"), Some("it's done\n"));
    }

    #[test]
    fn parses_positional_arg() {
        let c = parse_call("finished('ok')").unwrap();
        assert_eq!(c.arg_or_first("content"), Some("ok"));
        let c = parse_call("call_user()").unwrap();
        assert!(c.args.is_empty());
    }

    #[test]
    fn point_formats() {
        assert_eq!(parse_point("<point>100 200</point>"), Some((100.0, 200.0)));
        assert_eq!(parse_point("(10,20)"), Some((10.0, 20.0)));
        assert_eq!(parse_point("[0,0,100,50]"), Some((50.0, 25.0)));
        assert_eq!(parse_point("nowhere"), None);
    }

    #[test]
    fn split_respects_quotes() {
        let calls = split_calls("type(content='a) b(') \nhotkey(key='enter')");
        assert_eq!(calls, vec!["type(content='a) b(')", "hotkey(key='enter')"]);
    }

    #[tokio::test]
    async fn click_is_scaled_to_screen() {
        let g = UiTarsGrounder::default();
        let acts = g
            .ground("click(point='<point>500 500</point>')", SCREEN)
            .await
            .unwrap();
        assert_eq!(acts, vec![PrimitiveAction::Click { x: 960, y: 540, button: MouseButton::Left }]);
    }

    #[tokio::test]
    async fn type_with_newline_submits() {
        let g = UiTarsGrounder::default();
        let acts = g.ground(r"type(content='hello\n')", SCREEN).await.unwrap();
        assert_eq!(
            acts,
            vec![
                PrimitiveAction::Type { text: "hello".into() },
                PrimitiveAction::Hotkey { keys: vec!["enter".into()] },
            ]
        );
    }

    #[tokio::test]
    async fn drag_and_scroll() {
        let g = UiTarsGrounder { grid: None, ..Default::default() };
        let acts = g
            .ground(
                "Action: drag(start_point='<point>1 2</point>', end_point='<point>3 4</point>')",
                SCREEN,
            )
            .await
            .unwrap();
        assert_eq!(acts, vec![PrimitiveAction::Drag { from: (1, 2), to: (3, 4) }]);

        let acts = g
            .ground("Action: scroll(point='<point>7 8</point>', direction='up')", SCREEN)
            .await
            .unwrap();
        assert_eq!(
            acts,
            vec![PrimitiveAction::Scroll { x: 7, y: 8, direction: ScrollDirection::Up, amount: 5 }]
        );
    }

    #[tokio::test]
    async fn marker_prefix_is_tolerated() {
        let g = UiTarsGrounder::default();
        let acts = g.ground("Action: wait()", SCREEN).await.unwrap();
        assert_eq!(acts, vec![PrimitiveAction::Wait { ms: g.wait_ms }]);
    }

    #[tokio::test]
    async fn unknown_action_is_an_error() {
        let g = UiTarsGrounder::default();
        assert!(g.ground("teleport(to='mars')", SCREEN).await.is_err());
        assert!(g.ground("   ", SCREEN).await.is_err());
    }
}
