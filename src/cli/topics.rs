use std::error::Error;

use crate::cli::setup::Workspace;
use crate::core::library::Library;

pub fn list_topics() -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::open()?;
    print!("{}", render_topics(&workspace.library));
    Ok(())
}

/// One block per assistant, most recently updated topic first.
pub fn render_topics(library: &Library) -> String {
    let mut out = String::new();
    for assistant in library.assistants() {
        out.push_str(&format!("{} ({})\n", assistant.name, assistant.id));

        let mut topics = library.topics(&assistant.id);
        if topics.is_empty() {
            out.push_str("  (no topics)\n");
            continue;
        }
        topics.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        for topic in topics {
            let count = library
                .store()
                .persistence()
                .load(&topic.id)
                .ok()
                .flatten()
                .map(|messages| messages.len());
            let count = count.map_or_else(|| "?".to_string(), |n| n.to_string());
            out.push_str(&format!(
                "  {}  {}  ({} messages, updated {})\n",
                topic.id,
                topic.name,
                count,
                topic.updated_at.format("%Y-%m-%d %H:%M")
            ));
        }
    }
    out
}
