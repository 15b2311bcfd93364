//! Prompt assembly for agent invocations: the addressed query plus context
//! blocks for unseen session messages and referenced threads.

use parley_schema::{AgentRequest, Message, Thread};

pub fn format_message(message: &Message) -> String {
    format!(
        "<message sender=\"{}\" receiver=\"{}\">\n{}\n</message>",
        message.sender,
        message.receiver.as_deref().unwrap_or(""),
        message.text
    )
}

fn format_thread(thread: &Thread) -> String {
    let messages: Vec<String> = thread.messages.iter().map(format_message).collect();
    format!(
        "<thread id=\"{}\">\n{}\n</thread>",
        thread.session_id,
        messages.join("\n")
    )
}

/// Build the full model input for a request: query, then new messages
/// between others in the current thread, then messages in other threads.
pub fn format_input(
    request: &AgentRequest,
    receiver: &str,
    updates: &[Message],
    threads: &[Thread],
) -> String {
    let query = format!(
        "You are the receiver of the following query:\n\n\
         <query sender=\"{}\" receiver=\"{}\">\n{}\n</query>\n\n\
         Please respond to this query.",
        request.sender, receiver, request.query
    );

    let updates_block = if updates.is_empty() {
        String::new()
    } else {
        let messages: Vec<String> = updates.iter().map(format_message).collect();
        format!(
            "\n\nNew messages between others in the current thread:\n\n<updates>\n{}\n</updates>",
            messages.join("\n")
        )
    };

    let threads_block = if threads.is_empty() {
        String::new()
    } else {
        let rendered: Vec<String> = threads.iter().map(format_thread).collect();
        format!(
            "\n\nMessages in other threads:\n\n<threads>\n{}\n</threads>",
            rendered.join("\n")
        )
    };

    format!("{query} You may use the following messages as context:\n\n<context>{updates_block}{threads_block}\n</context>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_message_handles_missing_receiver() {
        let msg = Message::new("alice", None, "hi all");
        let rendered = format_message(&msg);
        assert!(rendered.contains("sender=\"alice\""));
        assert!(rendered.contains("receiver=\"\""));
        assert!(rendered.contains("hi all"));
    }

    #[test]
    fn format_input_includes_context_blocks() {
        let request = AgentRequest::new("what's the weather?", "alice");
        let updates = vec![Message::new("bob", Some("carol".into()), "hello")];
        let threads = vec![Thread {
            session_id: "t1".into(),
            messages: vec![Message::new("dave", None, "earlier context")],
        }];

        let input = format_input(&request, "bot", &updates, &threads);
        assert!(input.contains("<query sender=\"alice\" receiver=\"bot\">"));
        assert!(input.contains("<updates>"));
        assert!(input.contains("<thread id=\"t1\">"));
        assert!(input.contains("earlier context"));
    }

    #[test]
    fn format_input_omits_empty_blocks() {
        let request = AgentRequest::new("hi", "alice");
        let input = format_input(&request, "bot", &[], &[]);
        assert!(!input.contains("<updates>"));
        assert!(!input.contains("<threads>"));
    }
}
