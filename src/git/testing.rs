//! Scripted command runner for tests.
//!
//! Rules match on the git subcommand (first token) plus any further tokens that must
//! appear somewhere in the arguments. The first matching rule answers; unmatched
//! commands succeed with empty output. Every invocation is recorded.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::command::{CommandRunner, ExecResult, GitError, Invocation};

/// Canned outcome of one command.
#[derive(Debug, Clone)]
pub enum Reply {
    Exit { code: i32, stdout: String, stderr: String },
    Timeout,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(stderr: &str) -> Self {
        Reply::exit(128, stderr)
    }

    pub fn exit(code: i32, stderr: &str) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn into_result(self, invocation: &Invocation) -> Result<ExecResult, GitError> {
        match self {
            Reply::Exit { code, stdout, stderr } => Ok(ExecResult {
                exit_code: Some(code),
                stdout,
                stderr,
            }),
            Reply::Timeout => Err(GitError::Timeout {
                command: invocation.command_line(),
                timeout: Duration::from_secs(1),
            }),
        }
    }
}

type ReplyFn = Box<dyn Fn(&Invocation) -> Reply + Send + Sync>;

enum Source {
    /// Replies used in order; the last one repeats.
    Queue(VecDeque<Reply>),
    Func(ReplyFn),
}

struct Rule {
    pattern: Vec<String>,
    source: Source,
}

impl Rule {
    fn matches(&self, args: &[String]) -> bool {
        let Some((first, rest)) = self.pattern.split_first() else {
            return true;
        };
        args.first() == Some(first) && rest.iter().all(|token| args.contains(token))
    }
}

/// Records invocations and answers them from rules.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer matching commands with `reply`.
    pub fn on(&self, pattern: &[&str], reply: Reply) {
        self.on_seq(pattern, vec![reply]);
    }

    /// Answer matching commands with `replies` in order, repeating the last one.
    pub fn on_seq(&self, pattern: &[&str], replies: Vec<Reply>) {
        self.push(pattern, Source::Queue(replies.into()));
    }

    /// Answer matching commands by calling `f`.
    pub fn on_fn(&self, pattern: &[&str], f: impl Fn(&Invocation) -> Reply + Send + Sync + 'static) {
        self.push(pattern, Source::Func(Box::new(f)));
    }

    fn push(&self, pattern: &[&str], source: Source) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.iter().map(|s| s.to_string()).collect(),
            source,
        });
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose subcommand args match `pattern` like a rule would.
    pub fn calls_matching(&self, pattern: &[&str]) -> Vec<Invocation> {
        let rule = Rule {
            pattern: pattern.iter().map(|s| s.to_string()).collect(),
            source: Source::Queue(VecDeque::new()),
        };
        self.calls()
            .into_iter()
            .filter(|c| rule.matches(c.subcommand_args()))
            .collect()
    }

    /// Printable command lines of every call, for assertion messages.
    pub fn transcript(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command_line).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<ExecResult, GitError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let args = invocation.subcommand_args();
        let reply = {
            let mut rules = self.rules.lock().unwrap();
            rules.iter_mut().find(|r| r.matches(args)).map(|rule| match &mut rule.source {
                Source::Queue(queue) => {
                    if queue.len() > 1 {
                        queue.pop_front().unwrap()
                    } else {
                        queue.front().cloned().unwrap_or_else(|| Reply::ok(""))
                    }
                }
                Source::Func(f) => f(invocation),
            })
        };
        reply.unwrap_or_else(|| Reply::ok("")).into_result(invocation)
    }
}
