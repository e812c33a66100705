//! Interactive conflict resolution on a terminal.

use async_trait::async_trait;
use drive_sync_core::{ConflictFile, ConflictResolver, Resolution};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;
use tracing::warn;

/// Lines of each side shown before asking.
const PREVIEW_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Local,
    Remote,
}

fn parse_choice(answer: &str) -> Option<Choice> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" | "l" | "local" => Some(Choice::Local),
        "r" | "remote" => Some(Choice::Remote),
        _ => None,
    }
}

fn preview(content: &[u8]) -> String {
    if content.is_empty() {
        return "    (deleted or empty)\n".to_string();
    }
    let text = String::from_utf8_lossy(content);
    let mut out = String::new();
    for line in text.lines().take(PREVIEW_LINES) {
        out.push_str("    ");
        out.push_str(line);
        out.push('\n');
    }
    if text.lines().count() > PREVIEW_LINES {
        out.push_str("    ...\n");
    }
    out
}

/// Asks which side to keep for every conflicting path.
///
/// An empty answer keeps the local version. If input ends early, the
/// remaining conflicts keep their local version too.
pub struct PromptResolver<R, W> {
    io: Mutex<(R, W)>,
}

pub type TerminalResolver = PromptResolver<BufReader<Stdin>, Stdout>;

impl TerminalResolver {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> PromptResolver<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }

    /// Consume the resolver, returning its input and output.
    pub fn into_inner(self) -> (R, W) {
        self.io.into_inner()
    }

    async fn ask(input: &mut R, output: &mut W, conflict: &ConflictFile) -> std::io::Result<Choice> {
        let header = format!(
            "\nConflict: {}\n  local ({} bytes):\n{}  remote ({} bytes):\n{}",
            conflict.path,
            conflict.local_content.len(),
            preview(&conflict.local_content),
            conflict.remote_content.len(),
            preview(&conflict.remote_content),
        );
        output.write_all(header.as_bytes()).await?;

        loop {
            output.write_all(b"Keep [l]ocal or [r]emote? [l] ").await?;
            output.flush().await?;

            let mut answer = String::new();
            if input.read_line(&mut answer).await? == 0 {
                warn!("No answer for {}, keeping local version", conflict.path);
                return Ok(Choice::Local);
            }
            match parse_choice(&answer) {
                Some(choice) => return Ok(choice),
                None => output.write_all(b"Please answer 'l' or 'r'.\n").await?,
            }
        }
    }
}

#[async_trait]
impl<R, W> ConflictResolver for PromptResolver<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn resolve(&self, conflicts: Vec<ConflictFile>) -> Vec<Resolution> {
        let mut io = self.io.lock().await;
        let (input, output) = &mut *io;
        let mut resolutions = Vec::with_capacity(conflicts.len());

        for conflict in conflicts {
            let choice = match Self::ask(input, output, &conflict).await {
                Ok(choice) => choice,
                Err(e) => {
                    warn!("Prompt failed for {} ({}), keeping local version", conflict.path, e);
                    Choice::Local
                }
            };
            let content = match choice {
                Choice::Local => conflict.local_content,
                Choice::Remote => conflict.remote_content,
            };
            resolutions.push(Resolution {
                path: conflict.path,
                content,
            });
        }

        resolutions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(path: &str) -> ConflictFile {
        ConflictFile {
            path: path.to_string(),
            remote_content: format!("remote {}", path).into_bytes(),
            local_content: format!("local {}", path).into_bytes(),
        }
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("l\n"), Some(Choice::Local));
        assert_eq!(parse_choice("\n"), Some(Choice::Local));
        assert_eq!(parse_choice("Remote"), Some(Choice::Remote));
        assert_eq!(parse_choice("x"), None);
    }

    #[test]
    fn test_preview_truncates() {
        let text = (1..=8).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let shown = preview(text.as_bytes());
        assert!(shown.contains("line 5"));
        assert!(!shown.contains("line 6"));
        assert!(shown.ends_with("...\n"));
        assert!(preview(b"").contains("deleted or empty"));
    }

    #[tokio::test]
    async fn test_answers_pick_each_side() {
        let input: &[u8] = b"r\nwhat\nl\n";
        let resolver = PromptResolver::new(input, Vec::new());

        let resolutions = resolver.resolve(vec![conflict("a.md"), conflict("b.md")]).await;
        assert_eq!(resolutions.len(), 2);
        assert_eq!(resolutions[0].content, b"remote a.md");
        assert_eq!(resolutions[1].content, b"local b.md");

        let (_, output) = resolver.into_inner();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("Conflict: a.md"));
        assert!(output.contains("Please answer"));
    }

    #[tokio::test]
    async fn test_eof_keeps_local() {
        let input: &[u8] = b"";
        let resolver = PromptResolver::new(input, Vec::new());

        let resolutions = resolver.resolve(vec![conflict("a.md")]).await;
        assert_eq!(resolutions[0].path, "a.md");
        assert_eq!(resolutions[0].content, b"local a.md");
    }
}
