use crate::onebot::{Message, Segment};

/// Returns the command arguments when `message` starts with one of
/// `command_start` immediately followed by one of `names`.
///
/// Leading reply segments are skipped, and whitespace before the arguments
/// is dropped.
pub fn parse(message: &Message, names: &[&str], command_start: &[String]) -> Option<Message> {
    let mut segments = message
        .iter()
        .skip_while(|segment| matches!(segment, Segment::Reply(_)));

    let Some(Segment::Text(first)) = segments.next() else {
        return None;
    };
    let text = first.trim_start();

    let mut starts: Vec<&str> = command_start.iter().map(String::as_str).collect();
    starts.sort_by_key(|start| std::cmp::Reverse(start.len()));
    let mut names = names.to_vec();
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));

    let rest = starts.iter().find_map(|start| {
        let after_start = text.strip_prefix(start)?;
        names.iter().find_map(|name| after_start.strip_prefix(name))
    })?;

    let mut args = Message::new();
    let rest = rest.trim_start();
    if !rest.is_empty() {
        args.push(Segment::text(rest));
    }
    args.extend(segments.cloned());
    Some(args)
}
