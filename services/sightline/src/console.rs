//! Line-oriented stand-in for the touch surface.
//!
//! Gesture words are expanded into timed pointer scripts and fed to the
//! gesture recognizer; control words go straight to the session.

use anyhow::Result;
use sightline_core::{Mode, PointerEvent, SessionHandle};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Touch {
    Down,
    Move,
    Up,
}

/// One pointer event of a script, `after` the previous one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptedTouch {
    pub after: Duration,
    pub touch: Touch,
    pub x: f32,
    pub y: f32,
}

impl ScriptedTouch {
    fn new(after_ms: u64, touch: Touch, x: f32, y: f32) -> Self {
        Self {
            after: Duration::from_millis(after_ms),
            touch,
            x,
            y,
        }
    }

    fn event(&self, at: Instant) -> PointerEvent {
        let (x, y) = (self.x, self.y);
        match self.touch {
            Touch::Down => PointerEvent::Down { x, y, at },
            Touch::Move => PointerEvent::Move { x, y, at },
            Touch::Up => PointerEvent::Up { x, y, at },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleLine {
    Touches(Vec<ScriptedTouch>),
    Start,
    Stop,
    Pause,
    Query,
    Mode(Mode),
    Safety,
    Help,
    Quit,
}

pub const HELP: &str = "\
gestures: tap | double | triple | left | right | hold | down X Y | move X Y | up X Y
controls: start | stop | pause | query | mode <navigation|reading|object> | safety | quit";

fn taps(count: usize) -> Vec<ScriptedTouch> {
    (0..count)
        .flat_map(|i| {
            let gap = if i == 0 { 0 } else { 80 };
            [
                ScriptedTouch::new(gap, Touch::Down, 0.0, 0.0),
                ScriptedTouch::new(50, Touch::Up, 0.0, 0.0),
            ]
        })
        .collect()
}

fn swipe(dx: f32) -> Vec<ScriptedTouch> {
    let x0 = if dx < 0.0 { -dx } else { 0.0 };
    vec![
        ScriptedTouch::new(0, Touch::Down, x0, 0.0),
        ScriptedTouch::new(60, Touch::Move, x0 + dx / 2.0, 0.0),
        ScriptedTouch::new(60, Touch::Up, x0 + dx, 0.0),
    ]
}

fn point(words: &[&str], touch: Touch) -> Option<ConsoleLine> {
    let [x, y] = words else {
        return None;
    };
    let x = x.parse().ok()?;
    let y = y.parse().ok()?;
    Some(ConsoleLine::Touches(vec![ScriptedTouch::new(0, touch, x, y)]))
}

/// Parses one input line. `None` for blank or unrecognised input.
pub fn parse_line(line: &str) -> Option<ConsoleLine> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let (first, rest) = words.split_first()?;
    let line = match first.to_ascii_lowercase().as_str() {
        "tap" => ConsoleLine::Touches(taps(1)),
        "double" => ConsoleLine::Touches(taps(2)),
        "triple" => ConsoleLine::Touches(taps(3)),
        "left" => ConsoleLine::Touches(swipe(-200.0)),
        "right" => ConsoleLine::Touches(swipe(200.0)),
        "hold" => ConsoleLine::Touches(vec![
            ScriptedTouch::new(0, Touch::Down, 0.0, 0.0),
            ScriptedTouch::new(1_000, Touch::Up, 0.0, 0.0),
        ]),
        "down" => return point(rest, Touch::Down),
        "move" => return point(rest, Touch::Move),
        "up" => return point(rest, Touch::Up),
        "start" => ConsoleLine::Start,
        "stop" => ConsoleLine::Stop,
        "pause" | "resume" => ConsoleLine::Pause,
        "query" | "ask" => ConsoleLine::Query,
        "mode" => ConsoleLine::Mode(rest.first()?.parse().ok()?),
        "safety" => ConsoleLine::Safety,
        "help" | "?" => ConsoleLine::Help,
        "quit" | "exit" => ConsoleLine::Quit,
        _ => return None,
    };
    Some(line)
}

/// Reads stdin until `quit` or end of input.
pub async fn run_console(handle: SessionHandle, pointer: mpsc::Sender<PointerEvent>) -> Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(parsed) = parse_line(&line) else {
            if !line.trim().is_empty() {
                println!("Unrecognised input: {line:?} (type help)");
            }
            continue;
        };
        match parsed {
            ConsoleLine::Touches(script) => {
                for step in script {
                    tokio::time::sleep(step.after).await;
                    pointer.send(step.event(Instant::now())).await?;
                }
            }
            ConsoleLine::Start => handle.start().await?,
            ConsoleLine::Stop => handle.stop().await?,
            ConsoleLine::Pause => handle.toggle_pause().await?,
            ConsoleLine::Query => handle.trigger_action().await?,
            ConsoleLine::Mode(mode) => handle.request_mode_change(mode).await?,
            ConsoleLine::Safety => handle.toggle_safety().await?,
            ConsoleLine::Help => println!("{HELP}"),
            ConsoleLine::Quit => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sightline_core::gesture::{Action, GestureRecognizer};

    /// Plays a script through a recognizer with virtual timestamps.
    fn recognise(script: &[ScriptedTouch]) -> Vec<Action> {
        let mut recognizer = GestureRecognizer::default();
        let mut at = Instant::now();
        let mut actions = Vec::new();
        for step in script {
            let next = at + step.after;
            while let Some(deadline) = recognizer.next_deadline().filter(|d| *d <= next) {
                actions.extend(recognizer.poll(deadline));
            }
            at = next;
            actions.extend(recognizer.handle(step.event(at)));
        }
        while let Some(deadline) = recognizer.next_deadline() {
            actions.extend(recognizer.poll(deadline));
        }
        actions
    }

    fn script(line: &str) -> Vec<ScriptedTouch> {
        match parse_line(line) {
            Some(ConsoleLine::Touches(script)) => script,
            other => panic!("{line:?} parsed as {other:?}"),
        }
    }

    #[test]
    fn gesture_words_produce_their_gestures() {
        assert_eq!(recognise(&script("tap")), vec![Action::SingleTap]);
        assert_eq!(recognise(&script("double")), vec![Action::DoubleTap]);
        assert_eq!(recognise(&script("TRIPLE")), vec![Action::TripleTap]);
        assert_eq!(recognise(&script("left")), vec![Action::SwipeLeft]);
        assert_eq!(recognise(&script("right")), vec![Action::SwipeRight]);
        assert_eq!(recognise(&script("hold")), vec![Action::LongPress]);
    }

    #[test]
    fn raw_pointer_events_take_coordinates() {
        let touches = script("down 10 20.5");
        assert_eq!(touches.len(), 1);
        assert_eq!(touches[0].touch, Touch::Down);
        assert_eq!((touches[0].x, touches[0].y), (10.0, 20.5));
        assert_eq!(parse_line("up 10"), None);
        assert_eq!(parse_line("move a b"), None);
    }

    #[test]
    fn control_words_map_to_commands() {
        assert_eq!(parse_line("start"), Some(ConsoleLine::Start));
        assert_eq!(parse_line("  stop "), Some(ConsoleLine::Stop));
        assert_eq!(parse_line("resume"), Some(ConsoleLine::Pause));
        assert_eq!(parse_line("query"), Some(ConsoleLine::Query));
        assert_eq!(parse_line("mode reading"), Some(ConsoleLine::Mode(Mode::Reading)));
        assert_eq!(parse_line("mode"), None);
        assert_eq!(parse_line("mode cycling"), None);
        assert_eq!(parse_line("safety"), Some(ConsoleLine::Safety));
        assert_eq!(parse_line("quit"), Some(ConsoleLine::Quit));
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("dance"), None);
    }
}
