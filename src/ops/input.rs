//! Input synthesis: mouse, touch, and keyboard gesture composition, plus
//! the form primitives built on top of them.

use serde::Serialize;
use serde_json::{json, Value};

use super::{evaluate, resolve_center, resolve_node_id};
use crate::cdp::{Cancel, Connection};
use crate::error::Error;

fn keycode(key: &str) -> Option<i64> {
    Some(match key {
        "Enter" => 13,
        "Tab" => 9,
        "Escape" => 27,
        "Backspace" => 8,
        "Delete" => 46,
        "ArrowUp" => 38,
        "ArrowDown" => 40,
        "ArrowLeft" => 37,
        "ArrowRight" => 39,
        "Home" => 36,
        "End" => 35,
        "PageUp" => 33,
        "PageDown" => 34,
        "Space" => 32,
        _ => return None,
    })
}

fn modifier_mask(modifiers: &[String]) -> i64 {
    modifiers.iter().fold(0, |mask, m| {
        mask | match m.as_str() {
            "Shift" => 1,
            "Ctrl" => 2,
            "Alt" => 4,
            "Meta" => 8,
            _ => 0,
        }
    })
}

async fn mouse_event(
    connection: &Connection,
    session_id: &str,
    kind: &str,
    x: f64,
    y: f64,
    button: &str,
    click_count: i64,
    cancel: &Cancel,
) -> Result<(), Error> {
    connection
        .call_session(
            session_id,
            "Input.dispatchMouseEvent",
            Some(json!({
                "type": kind,
                "x": x,
                "y": y,
                "button": button,
                "clickCount": click_count,
            })),
            cancel,
        )
        .await?;
    Ok(())
}

async fn click_n(
    connection: &Connection,
    session_id: &str,
    x: f64,
    y: f64,
    button: &str,
    count: i64,
    cancel: &Cancel,
) -> Result<(), Error> {
    mouse_event(connection, session_id, "mouseMoved", x, y, button, 0, cancel).await?;
    for k in 1..=count {
        mouse_event(connection, session_id, "mousePressed", x, y, button, k, cancel).await?;
        mouse_event(connection, session_id, "mouseReleased", x, y, button, k, cancel).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ClickResult {
    pub clicked: bool,
    pub selector: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClickAtResult {
    pub clicked: bool,
    pub x: f64,
    pub y: f64,
}

macro_rules! click_variant {
    ($name:ident, $count:expr, $button:expr) => {
        /// # Errors
        ///
        /// `Error::NotFound` if `selector` matches nothing.
        pub async fn $name(
            connection: &Connection,
            session_id: &str,
            selector: &str,
            cancel: &Cancel,
        ) -> Result<ClickResult, Error> {
            let (x, y) = resolve_center(connection, session_id, selector, cancel).await?;
            click_n(connection, session_id, x, y, $button, $count, cancel).await?;
            Ok(ClickResult {
                clicked: true,
                selector: selector.to_string(),
            })
        }
    };
}

click_variant!(click, 1, "left");
click_variant!(doubleclick, 2, "left");
click_variant!(tripleclick, 3, "left");
click_variant!(rightclick, 1, "right");

/// `clickat(x, y)`: skips selector resolution entirely.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn clickat(
    connection: &Connection,
    session_id: &str,
    x: f64,
    y: f64,
    cancel: &Cancel,
) -> Result<ClickAtResult, Error> {
    click_n(connection, session_id, x, y, "left", 1, cancel).await?;
    Ok(ClickAtResult { clicked: true, x, y })
}

#[derive(Debug, Clone, Serialize)]
pub struct DragResult {
    pub dragged: bool,
}

/// `drag(src, dst)`: press at `src`'s center, move to `dst`'s center,
/// release there.
///
/// # Errors
///
/// `Error::NotFound` if either selector matches nothing.
pub async fn drag(
    connection: &Connection,
    session_id: &str,
    src_selector: &str,
    dst_selector: &str,
    cancel: &Cancel,
) -> Result<DragResult, Error> {
    let (sx, sy) = resolve_center(connection, session_id, src_selector, cancel).await?;
    let (dx, dy) = resolve_center(connection, session_id, dst_selector, cancel).await?;
    mouse_event(connection, session_id, "mouseMoved", sx, sy, "left", 0, cancel).await?;
    mouse_event(connection, session_id, "mousePressed", sx, sy, "left", 1, cancel).await?;
    mouse_event(connection, session_id, "mouseMoved", dx, dy, "left", 0, cancel).await?;
    mouse_event(connection, session_id, "mouseReleased", dx, dy, "left", 1, cancel).await?;
    Ok(DragResult { dragged: true })
}

async fn touch_event(
    connection: &Connection,
    session_id: &str,
    kind: &str,
    points: &[(f64, f64)],
    cancel: &Cancel,
) -> Result<(), Error> {
    let touch_points: Vec<Value> = points.iter().map(|(x, y)| json!({ "x": x, "y": y })).collect();
    connection
        .call_session(
            session_id,
            "Input.dispatchTouchEvent",
            Some(json!({ "type": kind, "touchPoints": touch_points })),
            cancel,
        )
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct TapResult {
    pub tapped: bool,
    pub selector: String,
}

/// `tap(selector)`.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn tap(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    cancel: &Cancel,
) -> Result<TapResult, Error> {
    let (x, y) = resolve_center(connection, session_id, selector, cancel).await?;
    touch_event(connection, session_id, "touchStart", &[(x, y)], cancel).await?;
    touch_event(connection, session_id, "touchEnd", &[], cancel).await?;
    Ok(TapResult {
        tapped: true,
        selector: selector.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SwipeResult {
    pub swiped: bool,
    pub selector: String,
    pub direction: String,
}

const SWIPE_MAGNITUDE: f64 = 100.0;
const GESTURE_STEPS: usize = 5;

/// `swipe(selector, direction)`: `direction` is one of `up`/`down`/`left`/`right`.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing, or
/// `Error::InvalidArgument` for an unrecognized `direction`.
pub async fn swipe(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    direction: &str,
    cancel: &Cancel,
) -> Result<SwipeResult, Error> {
    let (dx, dy) = match direction {
        "up" => (0.0, -SWIPE_MAGNITUDE),
        "down" => (0.0, SWIPE_MAGNITUDE),
        "left" => (-SWIPE_MAGNITUDE, 0.0),
        "right" => (SWIPE_MAGNITUDE, 0.0),
        other => return Err(Error::invalid_argument(format!("unknown swipe direction: {other}"))),
    };
    let (cx, cy) = resolve_center(connection, session_id, selector, cancel).await?;
    touch_event(connection, session_id, "touchStart", &[(cx, cy)], cancel).await?;
    for step in 1..=GESTURE_STEPS {
        let t = step as f64 / GESTURE_STEPS as f64;
        let x = cx + dx * t;
        let y = cy + dy * t;
        touch_event(connection, session_id, "touchMove", &[(x, y)], cancel).await?;
    }
    touch_event(connection, session_id, "touchEnd", &[], cancel).await?;
    Ok(SwipeResult {
        swiped: true,
        selector: selector.to_string(),
        direction: direction.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PinchResult {
    pub pinched: bool,
    pub selector: String,
    pub direction: String,
}

/// `pinch(selector, direction)`: `direction` is `in` or `out`.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing, or
/// `Error::InvalidArgument` for a direction outside `{in, out}`.
pub async fn pinch(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    direction: &str,
    cancel: &Cancel,
) -> Result<PinchResult, Error> {
    let (start, end) = match direction {
        "in" => (50.0_f64, 10.0_f64),
        "out" => (10.0_f64, 50.0_f64),
        other => return Err(Error::invalid_argument(format!("unknown pinch direction: {other}"))),
    };
    let (cx, cy) = resolve_center(connection, session_id, selector, cancel).await?;
    let start_points = [(cx - start, cy), (cx + start, cy)];
    touch_event(connection, session_id, "touchStart", &start_points, cancel).await?;
    for step in 1..=GESTURE_STEPS {
        let t = step as f64 / GESTURE_STEPS as f64;
        let offset = start + (end - start) * t;
        let points = [(cx - offset, cy), (cx + offset, cy)];
        touch_event(connection, session_id, "touchMove", &points, cancel).await?;
    }
    touch_event(connection, session_id, "touchEnd", &[], cancel).await?;
    Ok(PinchResult {
        pinched: true,
        selector: selector.to_string(),
        direction: direction.to_string(),
    })
}

async fn key_event(
    connection: &Connection,
    session_id: &str,
    kind: &str,
    key: &str,
    code: Option<i64>,
    text: Option<&str>,
    modifiers: i64,
    cancel: &Cancel,
) -> Result<(), Error> {
    let mut params = json!({
        "type": kind,
        "key": key,
        "modifiers": modifiers,
    });
    if let Some(c) = code {
        params["windowsVirtualKeyCode"] = json!(c);
        params["nativeVirtualKeyCode"] = json!(c);
    }
    if let Some(t) = text {
        params["text"] = json!(t);
    }
    connection
        .call_session(session_id, "Input.dispatchKeyEvent", Some(params), cancel)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct PressKeyResult {
    pub pressed: bool,
    pub key: String,
}

/// `presskey(key, modifiers)`: looks up a virtual keycode from the fixed
/// named-key table above.
///
/// # Errors
///
/// `Error::InvalidArgument` if `key` is not in the table.
pub async fn presskey(
    connection: &Connection,
    session_id: &str,
    key: &str,
    modifiers: &[String],
    cancel: &Cancel,
) -> Result<PressKeyResult, Error> {
    let code = keycode(key).ok_or_else(|| Error::invalid_argument(format!("unknown key: {key}")))?;
    let mask = modifier_mask(modifiers);
    key_event(connection, session_id, "keyDown", key, Some(code), None, mask, cancel).await?;
    key_event(connection, session_id, "keyUp", key, Some(code), None, mask, cancel).await?;
    Ok(PressKeyResult {
        pressed: true,
        key: key.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeResult {
    pub typed: bool,
    pub characters: usize,
}

/// `type(text)`: one `keyDown`/`keyUp` pair per logical character, with
/// `\n`→Enter, `\t`→Tab, and a literal backslash dispatched as-is.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn type_text(
    connection: &Connection,
    session_id: &str,
    text: &str,
    cancel: &Cancel,
) -> Result<TypeResult, Error> {
    let mut characters = 0;
    for c in text.chars() {
        match c {
            '\n' => {
                key_event(connection, session_id, "keyDown", "Enter", Some(13), Some("\r"), 0, cancel).await?;
                key_event(connection, session_id, "keyUp", "Enter", Some(13), Some("\r"), 0, cancel).await?;
            }
            '\t' => {
                key_event(connection, session_id, "keyDown", "Tab", Some(9), None, 0, cancel).await?;
                key_event(connection, session_id, "keyUp", "Tab", Some(9), None, 0, cancel).await?;
            }
            '\\' => {
                key_event(connection, session_id, "keyDown", "\\", None, Some("\\"), 0, cancel).await?;
                key_event(connection, session_id, "keyUp", "\\", None, None, 0, cancel).await?;
            }
            other => {
                let s = other.to_string();
                key_event(connection, session_id, "keyDown", &s, None, Some(&s), 0, cancel).await?;
                key_event(connection, session_id, "keyUp", &s, None, None, 0, cancel).await?;
            }
        }
        characters += 1;
    }
    Ok(TypeResult {
        typed: true,
        characters,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct FillResult {
    pub filled: bool,
    pub selector: String,
}

/// `fill(selector, text)`: focus, clear the existing value, insert text.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn fill(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    text: &str,
    cancel: &Cancel,
) -> Result<FillResult, Error> {
    let node_id = resolve_node_id(connection, session_id, selector, cancel).await?;
    connection
        .call_session(session_id, "DOM.focus", Some(json!({ "nodeId": node_id })), cancel)
        .await?;
    let escaped = escape_js_string(selector);
    evaluate(
        connection,
        session_id,
        &format!("document.querySelector(\"{escaped}\").value=''"),
        cancel,
    )
    .await?;
    connection
        .call_session(session_id, "Input.insertText", Some(json!({ "text": text })), cancel)
        .await?;
    Ok(FillResult {
        filled: true,
        selector: selector.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub cleared: bool,
    pub selector: String,
}

/// `clear(selector)`: focus, select-all (Ctrl+A), delete.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn clear(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    cancel: &Cancel,
) -> Result<ClearResult, Error> {
    let node_id = resolve_node_id(connection, session_id, selector, cancel).await?;
    connection
        .call_session(session_id, "DOM.focus", Some(json!({ "nodeId": node_id })), cancel)
        .await?;
    key_event(connection, session_id, "keyDown", "a", None, Some("a"), 2, cancel).await?;
    key_event(connection, session_id, "keyUp", "a", None, None, 2, cancel).await?;
    key_event(connection, session_id, "keyDown", "Delete", Some(46), None, 0, cancel).await?;
    key_event(connection, session_id, "keyUp", "Delete", Some(46), None, 0, cancel).await?;
    Ok(ClearResult {
        cleared: true,
        selector: selector.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SetValueResult {
    pub set: bool,
    pub selector: String,
    pub value: String,
}

/// `setvalue(selector, value)`: assign `.value` and dispatch bubbling
/// `input`/`change` events.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn setvalue(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    value: &str,
    cancel: &Cancel,
) -> Result<SetValueResult, Error> {
    resolve_node_id(connection, session_id, selector, cancel).await?;
    let sel = escape_js_string(selector);
    let val = escape_js_string(value);
    let script = format!(
        "(function(){{const e=document.querySelector(\"{sel}\");e.value=\"{val}\";\
         e.dispatchEvent(new Event('input',{{bubbles:true}}));\
         e.dispatchEvent(new Event('change',{{bubbles:true}}));return true;}})()"
    );
    evaluate(connection, session_id, &script, cancel).await?;
    Ok(SetValueResult {
        set: true,
        selector: selector.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectResult {
    pub selected: bool,
    pub selector: String,
    pub value: String,
}

/// `select(selector, option_value)`: set `.value` on a `<select>` and
/// dispatch bubbling `change`.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing, or
/// `Error::Unsupported` if the element is not a `SELECT`.
pub async fn select(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    option_value: &str,
    cancel: &Cancel,
) -> Result<SelectResult, Error> {
    resolve_node_id(connection, session_id, selector, cancel).await?;
    let described = super::dom::query(connection, session_id, selector, cancel).await?;
    if described.tag_name != "SELECT" {
        return Err(Error::unsupported(format!("{selector} is not a SELECT element")));
    }
    let sel = escape_js_string(selector);
    let val = escape_js_string(option_value);
    let script = format!(
        "(function(){{const e=document.querySelector(\"{sel}\");e.value=\"{val}\";\
         e.dispatchEvent(new Event('change',{{bubbles:true}}));return true;}})()"
    );
    evaluate(connection, session_id, &script, cancel).await?;
    Ok(SelectResult {
        selected: true,
        selector: selector.to_string(),
        value: option_value.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub checked: bool,
    pub selector: String,
}

async fn set_checked(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    desired: bool,
    cancel: &Cancel,
) -> Result<CheckResult, Error> {
    resolve_node_id(connection, session_id, selector, cancel).await?;
    let sel = escape_js_string(selector);
    let script = format!(
        "(function(){{const e=document.querySelector(\"{sel}\");\
         if(e.checked==={desired}){{return false;}}\
         e.checked={desired};e.dispatchEvent(new Event('change',{{bubbles:true}}));return true;}})()"
    );
    evaluate(connection, session_id, &script, cancel).await?;
    Ok(CheckResult {
        checked: desired,
        selector: selector.to_string(),
    })
}

/// `check(selector)`: idempotent — only dispatches `change` if state flips.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn check(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    cancel: &Cancel,
) -> Result<CheckResult, Error> {
    set_checked(connection, session_id, selector, true, cancel).await
}

/// `uncheck(selector)`: idempotent — only dispatches `change` if state flips.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn uncheck(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    cancel: &Cancel,
) -> Result<CheckResult, Error> {
    set_checked(connection, session_id, selector, false, cancel).await
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub uploaded: bool,
    pub selector: String,
}

/// `upload(selector, files)`.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn upload(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    files: &[String],
    cancel: &Cancel,
) -> Result<UploadResult, Error> {
    let node_id = resolve_node_id(connection, session_id, selector, cancel).await?;
    connection
        .call_session(
            session_id,
            "DOM.setFileInputFiles",
            Some(json!({ "nodeId": node_id, "files": files })),
            cancel,
        )
        .await?;
    Ok(UploadResult {
        uploaded: true,
        selector: selector.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub dispatched: bool,
    pub selector: String,
    pub event_type: String,
}

/// `dispatch(selector, event_type)`: `new Event(type, {bubbles:true,
/// cancelable:true})` dispatched against the resolved element.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn dispatch(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    event_type: &str,
    cancel: &Cancel,
) -> Result<DispatchResult, Error> {
    resolve_node_id(connection, session_id, selector, cancel).await?;
    let sel = escape_js_string(selector);
    let ty = escape_js_string(event_type);
    let script = format!(
        "document.querySelector(\"{sel}\").dispatchEvent(new Event(\"{ty}\",{{bubbles:true,cancelable:true}}))"
    );
    evaluate(connection, session_id, &script, cancel).await?;
    Ok(DispatchResult {
        dispatched: true,
        selector: selector.to_string(),
        event_type: event_type.to_string(),
    })
}

fn escape_js_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keycode_table_matches_spec() {
        assert_eq!(keycode("Enter"), Some(13));
        assert_eq!(keycode("Tab"), Some(9));
        assert_eq!(keycode("Escape"), Some(27));
        assert_eq!(keycode("Backspace"), Some(8));
        assert_eq!(keycode("Delete"), Some(46));
        assert_eq!(keycode("ArrowUp"), Some(38));
        assert_eq!(keycode("ArrowDown"), Some(40));
        assert_eq!(keycode("ArrowLeft"), Some(37));
        assert_eq!(keycode("ArrowRight"), Some(39));
        assert_eq!(keycode("Home"), Some(36));
        assert_eq!(keycode("End"), Some(35));
        assert_eq!(keycode("PageUp"), Some(33));
        assert_eq!(keycode("PageDown"), Some(34));
        assert_eq!(keycode("Space"), Some(32));
        assert_eq!(keycode("Nonsense"), None);
    }

    #[test]
    fn modifier_mask_matches_spec_bitfield() {
        assert_eq!(modifier_mask(&["Shift".to_string()]), 1);
        assert_eq!(modifier_mask(&["Ctrl".to_string()]), 2);
        assert_eq!(modifier_mask(&["Alt".to_string()]), 4);
        assert_eq!(modifier_mask(&["Meta".to_string()]), 8);
        assert_eq!(
            modifier_mask(&["Shift".to_string(), "Ctrl".to_string()]),
            3
        );
        assert_eq!(modifier_mask(&["Unknown".to_string()]), 0);
    }

    #[test]
    fn escape_js_string_handles_quotes_and_backslashes() {
        assert_eq!(escape_js_string(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape_js_string(r"a\b"), r"a\\b");
    }
}
