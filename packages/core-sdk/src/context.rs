use crate::models::{
    ChatMessage, CodeContext, ContentPart, MessageContent, ProblemContext, Role, FIRST_MESSAGE,
};

/**
 * \brief 固定的系统指令模板。
 */
pub const SYSTEM_PROMPT: &str = "\
You are an AI coding assistant helping a user practise programming problems. \
The user may attach the problem statement, an image of it, and their current code.

Key points to consider:
1. The problem is a programming challenge that must be solved with code.
2. Read the problem statement, constraints and code carefully before answering.
3. Address every part of the user's prompt in a technical way.
4. Point out edge cases, limitations, and optimisation opportunities.
5. Do not provide a complete solution unless the user explicitly asks for one.

Keep replies concise and focused on the user's prompt.";

const CONTEXT_LEAD: &str =
    "Attached is my question and code (if none received, ignore this message).";

/**
 * \brief 组装上送消息序列。
 * \details 顺序为 [system, ...history(去除问候语), context?, prompt]；
 *          上下文紧邻其所支撑的提问，避免遮蔽实时对话。题目与代码原样嵌入，不截断。
 */
pub fn assemble(
    system_prompt: &str,
    problem: Option<&ProblemContext>,
    code: Option<&CodeContext>,
    history: &[ChatMessage],
    prompt: &str,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(history.len() + 3);
    out.push(ChatMessage::system(system_prompt));
    out.extend(
        strip_greeting(history)
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned(),
    );
    if let Some(segment) = context_segment(problem, code) {
        out.push(segment);
    }
    out.push(ChatMessage::user(prompt));
    out
}

fn strip_greeting(history: &[ChatMessage]) -> &[ChatMessage] {
    match history.first() {
        Some(first) if is_greeting(first) => &history[1..],
        _ => history,
    }
}

fn is_greeting(message: &ChatMessage) -> bool {
    message.role == Role::Assistant
        && matches!(&message.content, MessageContent::Text(t) if t == FIRST_MESSAGE)
}

/**
 * \brief 构造题目/代码上下文段；两者皆无时返回 None。
 */
pub fn context_segment(
    problem: Option<&ProblemContext>,
    code: Option<&CodeContext>,
) -> Option<ChatMessage> {
    if problem.is_none() && code.is_none() {
        return None;
    }
    let mut parts = vec![ContentPart::Text {
        text: CONTEXT_LEAD.to_string(),
    }];
    if let Some(p) = problem {
        parts.push(ContentPart::Text {
            text: format!(
                "This is my problem title: {}\nThis is my problem description:\n{}",
                p.title, p.description
            ),
        });
        if let Some(image) = &p.image {
            parts.push(ContentPart::Image {
                image: image.clone(),
            });
        }
    }
    if let Some(c) = code {
        parts.push(ContentPart::Text {
            text: format!(
                "This is my code:\n```{}\n{}\n```",
                c.language_tag, c.source_code
            ),
        });
    }
    Some(ChatMessage {
        role: Role::User,
        content: MessageContent::Parts(parts),
    })
}
