//! Namespace-agnostic text extraction from hive XML messages.
//!
//! Paths are matched the way `//a/b/text()` selects nodes: the element `b`
//! whose parent is `a`, anywhere in the document. Only the first text node of
//! the first matching element is returned.

use quick_xml::events::Event;
use quick_xml::Reader;

/// Extract the text of the first element matching each path in a single pass.
///
/// The result has one slot per input path, `None` when nothing matched.
pub fn extract_paths(xml: &str, paths: &[&[&str]]) -> Result<Vec<Option<String>>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut found: Vec<Option<String>> = vec![None; paths.len()];
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.local_name();
                stack.push(String::from_utf8_lossy(name.as_ref()).into_owned());
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(e) => {
                let text = e.unescape()?;
                record(&mut found, paths, &stack, &text);
            }
            Event::CData(e) => {
                let raw = e.into_inner();
                record(&mut found, paths, &stack, &String::from_utf8_lossy(&raw));
            }
            Event::Eof => break,
            _ => {}
        }

        if found.iter().all(Option::is_some) {
            break;
        }
    }

    Ok(found)
}

/// Extract the text of the first element matching `path`.
pub fn extract_text(xml: &str, path: &[&str]) -> Result<Option<String>, quick_xml::Error> {
    Ok(extract_paths(xml, &[path])?.pop().flatten())
}

fn record(found: &mut [Option<String>], paths: &[&[&str]], stack: &[String], text: &str) {
    for (slot, path) in found.iter_mut().zip(paths) {
        if slot.is_none() && ends_with_path(stack, path) {
            *slot = Some(text.to_string());
        }
    }
}

fn ends_with_path(stack: &[String], path: &[&str]) -> bool {
    if path.is_empty() || stack.len() < path.len() {
        return false;
    }
    stack[stack.len() - path.len()..]
        .iter()
        .zip(path)
        .all(|(have, want)| have == want)
}
