//! Cleanup of SenseVoice's rich transcription output.
//!
//! The model prefixes each segment with inline tags such as
//! `<|zh|><|NEUTRAL|><|Speech|><|withitn|>`. Output matches funasr's
//! `rich_transcription_postprocess`:
//!
//! - the text is split into segments at language tags
//! - in each segment, audio events become leading emoji and the dominant
//!   emotion becomes one trailing emoji; other known tags are dropped
//! - segments are joined, with an event or emotion that repeats across
//!   a segment boundary emitted once

/// Emotion tags in tie-break order. Neutral is the baseline and has no emoji.
const EMOTIONS: &[(&str, &str)] = &[
    ("<|HAPPY|>", "😊"),
    ("<|SAD|>", "😔"),
    ("<|ANGRY|>", "😡"),
    ("<|NEUTRAL|>", ""),
    ("<|FEARFUL|>", "😰"),
    ("<|DISGUSTED|>", "🤢"),
    ("<|SURPRISED|>", "😮"),
];

const NEUTRAL: usize = 3;

/// Event tags. Each present event is prepended in this order, so the last
/// one listed ends up first.
const EVENTS: &[(&str, &str)] = &[
    ("<|BGM|>", "🎼"),
    ("<|Speech|>", ""),
    ("<|Applause|>", "👏"),
    ("<|Laughter|>", "😀"),
    ("<|Cry|>", "😭"),
    ("<|Sneeze|>", "🤧"),
    ("<|Breath|>", ""),
    ("<|Cough|>", "🤧"),
];

/// Tags removed without contributing anything.
const SILENT_TAGS: &[&str] = &[
    "<|zh|>",
    "<|en|>",
    "<|yue|>",
    "<|ja|>",
    "<|ko|>",
    "<|nospeech|>",
    "<|EMO_UNKNOWN|>",
    "<|Sing|>",
    "<|Speech_Noise|>",
    "<|withitn|>",
    "<|woitn|>",
    "<|GBG|>",
    "<|Event_UNK|>",
];

const LANGUAGE_TAGS: &[&str] = &["<|zh|>", "<|en|>", "<|yue|>", "<|ja|>", "<|ko|>", "<|nospeech|>"];

const SEGMENT_BREAK: &str = "<|lang|>";

/// No speech and an unclassified event, together.
const UNKNOWN_AUDIO: (&str, &str) = ("<|nospeech|><|Event_UNK|>", "❓");

const EMOTION_EMOJI: &[char] = &['😊', '😔', '😡', '😰', '🤢', '😮'];

const EVENT_EMOJI: &[char] = &['🎼', '👏', '😀', '😭', '🤧', '😷'];

fn emotion_at_end(s: &str) -> Option<char> {
    s.chars().last().filter(|c| EMOTION_EMOJI.contains(c))
}

fn event_at_start(s: &str) -> Option<char> {
    s.chars().next().filter(|c| EVENT_EMOJI.contains(c))
}

/// Count and strip the tags in one segment, then decorate it.
fn format_segment(segment: &str) -> String {
    let mut text = segment.to_string();

    let mut emotion_counts = [0usize; EMOTIONS.len()];
    for (count, (tag, _)) in emotion_counts.iter_mut().zip(EMOTIONS) {
        *count = text.matches(tag).count();
        text = text.replace(tag, "");
    }
    let mut events_present = [false; EVENTS.len()];
    for (present, (tag, _)) in events_present.iter_mut().zip(EVENTS) {
        *present = text.contains(tag);
        text = text.replace(tag, "");
    }
    for tag in SILENT_TAGS {
        text = text.replace(tag, "");
    }

    // A strictly higher count wins, so earlier emotions win ties
    let mut dominant = NEUTRAL;
    for (index, count) in emotion_counts.iter().enumerate() {
        if *count > emotion_counts[dominant] {
            dominant = index;
        }
    }

    for (present, (_, emoji)) in events_present.iter().zip(EVENTS) {
        if *present {
            text.insert_str(0, emoji);
        }
    }
    text.push_str(EMOTIONS[dominant].1);

    for emoji in EMOTION_EMOJI.iter().chain(EVENT_EMOJI) {
        let emoji = emoji.to_string();
        text = text.replace(&format!(" {}", emoji), &emoji);
        text = text.replace(&format!("{} ", emoji), &emoji);
    }
    text.trim().to_string()
}

/// Turn raw model output into display text.
pub fn rich_transcription_postprocess(raw: &str) -> String {
    let mut text = raw.replace(UNKNOWN_AUDIO.0, UNKNOWN_AUDIO.1);
    for tag in LANGUAGE_TAGS {
        text = text.replace(tag, SEGMENT_BREAK);
    }

    let mut segments = text
        .split(SEGMENT_BREAK)
        .map(|segment| format_segment(segment).trim_matches(' ').to_string());

    let mut out = format!(" {}", segments.next().unwrap_or_default());
    // Starts unset because `out` begins with a space
    let mut current_event = event_at_start(&out);

    for mut segment in segments {
        if segment.is_empty() {
            continue;
        }
        let event = event_at_start(&segment);
        if event.is_some() && event == current_event {
            segment.remove(0);
        }
        current_event = event_at_start(&segment);

        let emotion = emotion_at_end(&segment);
        if emotion.is_some() && emotion == emotion_at_end(&out) {
            out.pop();
        }
        out.push_str(segment.trim());
    }

    out.replace("The.", " ").trim().to_string()
}
