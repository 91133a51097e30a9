//! Prompt text handed to invoked agents.

use crate::queue::DirectQueueEntry;

pub const DM_PREFIX: &str = "#dm-";

const RULE: &str = "============================================================";

pub fn is_dm_channel(channel_name: &str) -> bool {
    channel_name.starts_with(DM_PREFIX)
}

/// The addressee of a DM channel: everything after `#dm-`. Names may contain `-`.
pub fn dm_target(channel_name: &str) -> Option<String> {
    channel_name
        .strip_prefix(DM_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

/// Prompt injected into an agent's session for a chat message.
pub fn invocation_prompt(
    sender: &str,
    channel_name: &str,
    content: &str,
    recent_context: Option<&str>,
) -> String {
    let header = if is_dm_channel(channel_name) {
        format!("[Tether] Direct message from {sender}.")
    } else {
        format!("[Tether] {sender} mentioned you in {channel_name}.")
    };

    let mut lines = vec![
        header,
        String::new(),
        format!("Reply using your `tether_send_message` MCP tool to channel \"{channel_name}\"."),
        "This tool is provided by the tether MCP server already configured in your environment."
            .to_string(),
        "Do NOT reply inline: the sender will not see it. Use the MCP tool.".to_string(),
        String::new(),
    ];
    if let Some(context) = recent_context.filter(|c| !c.trim().is_empty()) {
        lines.push("Recent messages:".to_string());
        lines.push(context.to_string());
        lines.push(String::new());
    }
    lines.push(format!("{sender}: {content}"));
    lines.join("\n")
}

/// Direct-message prompt with sender context and reply instructions.
pub fn wrap_direct(sender: &str, sender_project: Option<&str>, text: &str) -> String {
    let origin = match sender_project {
        Some(project) => format!("{sender} (project: {project})"),
        None => sender.to_string(),
    };
    format!(
        "[Tether] Direct message from {sender}.\n\
         Sender: {origin}\n\
         \n\
         --- MESSAGE ---\n\
         {text}\n\
         --- END MESSAGE ---\n\
         \n\
         This message was sent by another agent through Tether. Be concise. \
         If you have follow-up questions, use the `direct_message` tool to reach @{sender}."
    )
}

/// Block appended to an agent's next response listing the direct messages it just picked up.
pub fn render_pickup(agent: &str, entries: &[DirectQueueEntry]) -> String {
    let mut out = format!("\n\n{RULE}\nPENDING DIRECT MESSAGE(S), respond to these now:\n{RULE}\n\n");
    for entry in entries {
        out.push_str(&format!("FROM: @{}\n", entry.from_agent));
        out.push_str(&format!("MESSAGE ID: {}\n", entry.id));
        out.push_str(&format!("PROMPT: {}\n\n", entry.prompt));
        out.push_str(&format!(
            "-> Reply using: respond_direct(agent_name=\"{agent}\", message_id=\"{}\", response=\"...\")\n",
            entry.id
        ));
        out.push_str(&"-".repeat(40));
        out.push_str("\n\n");
    }
    out.push_str(
        "Process these before continuing with your current task. The sender is waiting.\n",
    );
    out.push_str(RULE);
    out
}
