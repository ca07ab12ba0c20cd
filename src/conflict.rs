// Conflict policy engine: one finite-state policy per operation deciding what
// to do when a file or folder already exists at the destination. "*All"
// answers are sticky for the remainder of the operation; prompts are
// serialized so concurrent workers never interleave on the terminal.

use std::io::{IsTerminal, Write};
use std::sync::Mutex;

use crate::PilotError;

/// What to do with one conflicting item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    SkipOnce,
    SkipAll,
    OverwriteOnce,
    OverwriteAll,
    ResumeOnce,
    ResumeAll,
    MergeOnce,
    MergeAll,
    Abort,
}

impl ConflictChoice {
    pub fn is_sticky(&self) -> bool {
        use ConflictChoice::*;
        matches!(self, SkipAll | OverwriteAll | ResumeAll | MergeAll)
    }

    /// Flag values accepted on the command line map to the sticky variants:
    /// a flag is an up-front decision for the whole operation.
    pub fn parse_flag(s: &str) -> Option<ConflictChoice> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Some(ConflictChoice::SkipAll),
            "overwrite" => Some(ConflictChoice::OverwriteAll),
            "resume" => Some(ConflictChoice::ResumeAll),
            "merge" => Some(ConflictChoice::MergeAll),
            "abort" => Some(ConflictChoice::Abort),
            _ => None,
        }
    }

    /// The action this choice selects, divorced from stickiness.
    pub fn action(&self) -> ConflictAction {
        use ConflictChoice::*;
        match self {
            SkipOnce | SkipAll => ConflictAction::Skip,
            OverwriteOnce | OverwriteAll => ConflictAction::Overwrite,
            ResumeOnce | ResumeAll => ConflictAction::Resume,
            MergeOnce | MergeAll => ConflictAction::Merge,
            Abort => ConflictAction::Abort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    Skip,
    Overwrite,
    Resume,
    Merge,
    Abort,
}

trait PromptSource: Send {
    fn ask(&mut self, item: &str) -> anyhow::Result<ConflictChoice>;
}

struct TtyPrompt;

impl PromptSource for TtyPrompt {
    fn ask(&mut self, item: &str) -> anyhow::Result<ConflictChoice> {
        let mut stdout = std::io::stdout();
        loop {
            write!(
                stdout,
                "目标已存在: {}\n  [s]跳过 [S]全部跳过 [o]覆盖 [O]全部覆盖 [r]续传 [R]全部续传 [m]合并 [M]全部合并 [a]中止 > ",
                item
            )
            .ok();
            stdout.flush().ok();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return Ok(ConflictChoice::Abort);
            }
            let choice = match line.trim() {
                "s" => Some(ConflictChoice::SkipOnce),
                "S" => Some(ConflictChoice::SkipAll),
                "o" => Some(ConflictChoice::OverwriteOnce),
                "O" => Some(ConflictChoice::OverwriteAll),
                "r" => Some(ConflictChoice::ResumeOnce),
                "R" => Some(ConflictChoice::ResumeAll),
                "m" => Some(ConflictChoice::MergeOnce),
                "M" => Some(ConflictChoice::MergeAll),
                "a" | "" => Some(ConflictChoice::Abort),
                _ => None,
            };
            if let Some(c) = choice {
                return Ok(c);
            }
            // 输入无效，重新提示
        }
    }
}

struct Inner {
    sticky: Option<ConflictAction>,
    prompt: Option<Box<dyn PromptSource>>,
}

/// Per-operation conflict policy. Construct once per command, share across
/// workers; the internal mutex both protects the sticky state and serializes
/// prompts.
pub struct ConflictPolicy {
    inner: Mutex<Inner>,
    /// Label used in error messages, e.g. "upload" / "download".
    operation: &'static str,
}

impl ConflictPolicy {
    /// Policy fixed up front by a CLI flag (sticky) or a default.
    pub fn fixed(operation: &'static str, choice: ConflictChoice) -> Self {
        ConflictPolicy {
            inner: Mutex::new(Inner { sticky: Some(choice.action()), prompt: None }),
            operation,
        }
    }

    /// Interactive policy: the first conflict prompts on the TTY. In a
    /// non-TTY context construction fails — callers must pass a flag.
    pub fn interactive(operation: &'static str) -> anyhow::Result<Self> {
        if !std::io::stdin().is_terminal() {
            return Err(PilotError::Config(format!(
                "{} 遇到冲突时需要 --on-conflict 标志（当前无终端可交互）",
                operation
            ))
            .into());
        }
        Ok(ConflictPolicy {
            inner: Mutex::new(Inner { sticky: None, prompt: Some(Box::new(TtyPrompt)) }),
            operation,
        })
    }

    #[cfg(test)]
    fn scripted(operation: &'static str, answers: Vec<ConflictChoice>) -> Self {
        struct Scripted(std::collections::VecDeque<ConflictChoice>);
        impl PromptSource for Scripted {
            fn ask(&mut self, _item: &str) -> anyhow::Result<ConflictChoice> {
                Ok(self.0.pop_front().expect("scripted prompt exhausted"))
            }
        }
        ConflictPolicy {
            inner: Mutex::new(Inner {
                sticky: None,
                prompt: Some(Box::new(Scripted(answers.into_iter().collect()))),
            }),
            operation,
        }
    }

    /// Decide what to do about `item`. Sticky answers short-circuit without
    /// prompting; `Abort` surfaces as a `Cancelled` error so the operation
    /// unwinds through the normal path.
    pub fn decide(&self, item: &str) -> anyhow::Result<ConflictAction> {
        let mut inner = self.inner.lock().map_err(|_| {
            PilotError::Fatal(format!("{} 冲突策略锁被破坏", self.operation))
        })?;
        if let Some(action) = inner.sticky {
            return Ok(action);
        }
        let choice = match inner.prompt.as_mut() {
            Some(p) => p.ask(item)?,
            None => {
                return Err(PilotError::Config(format!(
                    "{} 未指定冲突策略且无法交互",
                    self.operation
                ))
                .into());
            }
        };
        if choice.is_sticky() {
            inner.sticky = Some(choice.action());
        }
        if choice == ConflictChoice::Abort {
            return Err(PilotError::Cancelled.into());
        }
        Ok(choice.action())
    }
}
