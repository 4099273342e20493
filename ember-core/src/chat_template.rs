use crate::model::Architecture;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// What arms a lazy grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GrammarTrigger {
    /// Literal text appearing anywhere in the output.
    Word(String),
    /// A specific token id being sampled.
    Token(u32),
    /// Regex matched against the output; the grammar starts at the match.
    Pattern(String),
    /// Regex that must match the whole output so far.
    PatternFull(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    pub add_generation_prompt: bool,
    /// Grammar forwarded unchanged into the rendered result.
    pub grammar: Option<String>,
}

/// Output of a chat renderer: the prompt plus any decoding constraints the
/// format implies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderedChat {
    pub prompt: String,
    pub grammar: Option<String>,
    pub grammar_lazy: bool,
    pub grammar_triggers: Vec<GrammarTrigger>,
    pub preserved_tokens: Vec<String>,
    pub additional_stops: Vec<String>,
}

pub trait ChatRenderer: Send + Sync {
    fn render(&self, messages: &[ChatMessage], options: &ChatOptions) -> RenderedChat;
}

/// Fixed prefix/suffix template keyed by architecture.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    bos: &'static str,
    system: (&'static str, &'static str),
    user: (&'static str, &'static str),
    assistant: (&'static str, &'static str),
    generation_pre: &'static str,
    end_of_turn: &'static str,
}

impl ChatTemplate {
    pub fn for_architecture(arch: &Architecture) -> Option<Self> {
        let t = match arch {
            Architecture::Llama => Self {
                bos: "<|begin_of_text|>",
                system: ("<|start_header_id|>system<|end_header_id|>\n\n", "<|eot_id|>"),
                user: ("<|start_header_id|>user<|end_header_id|>\n\n", "<|eot_id|>"),
                assistant: ("<|start_header_id|>assistant<|end_header_id|>\n\n", "<|eot_id|>"),
                generation_pre: "<|start_header_id|>assistant<|end_header_id|>\n\n",
                end_of_turn: "<|eot_id|>",
            },
            Architecture::Mistral => Self {
                bos: "<s>",
                system: ("[INST] ", "\n"),
                user: ("[INST] ", " [/INST]"),
                assistant: ("", "</s>"),
                generation_pre: "",
                end_of_turn: "</s>",
            },
            Architecture::Phi => Self {
                bos: "",
                system: ("<|system|>\n", "<|end|>\n"),
                user: ("<|user|>\n", "<|end|>\n"),
                assistant: ("<|assistant|>\n", "<|end|>\n"),
                generation_pre: "<|assistant|>\n",
                end_of_turn: "<|end|>",
            },
            Architecture::Qwen => Self {
                bos: "",
                system: ("<|im_start|>system\n", "<|im_end|>\n"),
                user: ("<|im_start|>user\n", "<|im_end|>\n"),
                assistant: ("<|im_start|>assistant\n", "<|im_end|>\n"),
                generation_pre: "<|im_start|>assistant\n",
                end_of_turn: "<|im_end|>",
            },
            Architecture::Gemma => Self {
                bos: "",
                system: ("<start_of_turn>user\n", "<end_of_turn>\n"),
                user: ("<start_of_turn>user\n", "<end_of_turn>\n"),
                assistant: ("<start_of_turn>model\n", "<end_of_turn>\n"),
                generation_pre: "<start_of_turn>model\n",
                end_of_turn: "<end_of_turn>",
            },
            Architecture::Unknown(_) => return None,
        };
        Some(t)
    }
}

impl ChatRenderer for ChatTemplate {
    fn render(&self, messages: &[ChatMessage], options: &ChatOptions) -> RenderedChat {
        let mut prompt = String::from(self.bos);
        for msg in messages {
            let (pre, suf) = match msg.role {
                Role::System => self.system,
                Role::User => self.user,
                Role::Assistant => self.assistant,
            };
            prompt.push_str(pre);
            prompt.push_str(&msg.content);
            prompt.push_str(suf);
        }
        if options.add_generation_prompt {
            prompt.push_str(self.generation_pre);
        }
        RenderedChat {
            prompt,
            grammar: options.grammar.clone(),
            additional_stops: vec![self.end_of_turn.to_string()],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ChatOptions {
        ChatOptions {
            add_generation_prompt: true,
            grammar: None,
        }
    }

    #[test]
    fn llama3_prompt_shape() {
        let tmpl = ChatTemplate::for_architecture(&Architecture::Llama).unwrap();
        let out = tmpl.render(
            &[
                ChatMessage::new(Role::System, "You are helpful."),
                ChatMessage::new(Role::User, "Hello"),
            ],
            &opts(),
        );
        assert!(out.prompt.starts_with("<|begin_of_text|>"));
        assert!(out.prompt.contains("You are helpful.<|eot_id|>"));
        assert!(out.prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        assert_eq!(out.additional_stops, vec!["<|eot_id|>".to_string()]);
    }

    #[test]
    fn qwen_without_generation_prompt() {
        let tmpl = ChatTemplate::for_architecture(&Architecture::Qwen).unwrap();
        let out = tmpl.render(&[ChatMessage::new(Role::User, "Hi")], &ChatOptions::default());
        assert_eq!(out.prompt, "<|im_start|>user\nHi<|im_end|>\n");
    }

    #[test]
    fn grammar_passes_through() {
        let tmpl = ChatTemplate::for_architecture(&Architecture::Gemma).unwrap();
        let options = ChatOptions {
            grammar: Some("root ::= \"x\"".into()),
            ..opts()
        };
        let out = tmpl.render(&[ChatMessage::new(Role::User, "Test")], &options);
        assert_eq!(out.grammar.as_deref(), Some("root ::= \"x\""));
        assert!(!out.grammar_lazy);
    }

    #[test]
    fn unknown_architecture_has_no_template() {
        assert!(ChatTemplate::for_architecture(&Architecture::Unknown("rwkv".into())).is_none());
    }

    #[test]
    fn trigger_serde_shape() {
        let t: GrammarTrigger = serde_json::from_str(r#"{"type":"word","value":"<tool>"}"#).unwrap();
        assert_eq!(t, GrammarTrigger::Word("<tool>".into()));
    }
}
