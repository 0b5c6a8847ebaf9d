//! Ticket data model and document format
//!
//! A ticket is stored as one document: a TOML header between `+++`
//! fences followed by a markdown body (title, description, acceptance
//! criteria, comments). Parsing is strict; anything unexpected is a
//! `MalformedTicket` error rather than a silently empty field.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub type TicketId = String;

const FENCE: &str = "+++";
const DESCRIPTION_HEADING: &str = "## Description";
const CRITERIA_HEADING: &str = "## Acceptance Criteria";
const COMMENTS_HEADING: &str = "## Comments";

/// Lifecycle position of a ticket. Valid values come from the policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(String);

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for State {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One acceptance-criteria checklist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub text: String,
    pub done: bool,
}

impl Criterion {
    pub fn open(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }
}

/// One entry of the append-only comment log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub at: DateTime<Utc>,
    pub author: String,
    pub text: String,
}

/// Core ticket structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Unique identifier (<prefix>-xxxx)
    pub id: TicketId,

    /// Ticket type, one of the configured types
    #[serde(rename = "type")]
    pub ticket_type: String,

    /// Priority (0=critical, 1=high, 2=medium, 3=low, 4=backlog)
    pub priority: u8,

    /// Current lifecycle state
    pub state: State,

    /// Agent currently responsible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<String>,

    /// When the current assignment was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,

    /// Tickets that must be done before this one is ready
    #[serde(default)]
    pub depends_on: Vec<TicketId>,

    /// Tickets that depend on this one (derived)
    #[serde(default)]
    pub blocks: Vec<TicketId>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    pub updated_at: DateTime<Utc>,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub acceptance_criteria: Vec<Criterion>,

    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// Header fields as they appear between the `+++` fences
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    id: TicketId,
    #[serde(rename = "type")]
    ticket_type: String,
    priority: u8,
    state: State,
    #[serde(default)]
    depends_on: Vec<TicketId>,
    #[serde(default)]
    blocks: Vec<TicketId>,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_by: Option<String>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    assigned_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    assigned_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Create a ticket in the given initial state
    pub fn new(id: TicketId, title: String, ticket_type: String, state: State) -> Self {
        let now = Utc::now();
        Self {
            id,
            ticket_type,
            priority: 2,
            state,
            assigned_agent_id: None,
            assigned_at: None,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            created_at: now,
            created_by: None,
            updated_at: now,
            title,
            description: String::new(),
            acceptance_criteria: Vec::new(),
            comments: Vec::new(),
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_agent_id.is_some()
    }

    pub fn assign(&mut self, agent_id: impl Into<String>) {
        let now = Utc::now();
        self.assigned_agent_id = Some(agent_id.into());
        self.assigned_at = Some(now);
        self.updated_at = now;
    }

    pub fn unassign(&mut self) {
        self.assigned_agent_id = None;
        self.assigned_at = None;
        self.updated_at = Utc::now();
    }

    /// Append to the comment log. Existing entries are never touched.
    pub fn append_comment(&mut self, author: impl Into<String>, text: &str) {
        let now = Utc::now();
        self.comments.push(Comment {
            at: now,
            author: author.into(),
            text: text.trim().to_string(),
        });
        self.updated_at = now;
    }

    pub(crate) fn set_state(&mut self, state: State) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Serialize to the on-disk document format
    pub fn to_document(&self) -> Result<String> {
        let header = Header {
            id: self.id.clone(),
            ticket_type: self.ticket_type.clone(),
            priority: self.priority,
            state: self.state.clone(),
            depends_on: self.depends_on.clone(),
            blocks: self.blocks.clone(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            updated_at: self.updated_at,
            assigned_agent_id: self.assigned_agent_id.clone(),
            assigned_at: self.assigned_at,
        };

        let mut out = String::new();
        out.push_str(FENCE);
        out.push('\n');
        out.push_str(&toml::to_string(&header)?);
        out.push_str(FENCE);
        out.push_str("\n\n");

        out.push_str("# ");
        out.push_str(&self.title);
        out.push_str("\n\n");

        out.push_str(DESCRIPTION_HEADING);
        out.push_str("\n\n");
        if !self.description.is_empty() {
            out.push_str(&escape(&self.description));
            out.push_str("\n\n");
        }

        out.push_str(CRITERIA_HEADING);
        out.push_str("\n\n");
        if !self.acceptance_criteria.is_empty() {
            for criterion in &self.acceptance_criteria {
                let mark = if criterion.done { 'x' } else { ' ' };
                out.push_str(&format!("- [{}] {}\n", mark, criterion.text));
            }
            out.push('\n');
        }

        out.push_str(COMMENTS_HEADING);
        out.push('\n');
        for comment in &self.comments {
            out.push_str(&format!(
                "\n### {} {}\n\n",
                comment.at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                comment.author
            ));
            if !comment.text.is_empty() {
                out.push_str(&escape(&comment.text));
                out.push('\n');
            }
        }

        Ok(out)
    }

    /// Parse a document. `id` is only used for error reporting.
    pub fn from_document(id: &str, content: &str) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedTicket {
            id: id.to_string(),
            reason,
        };

        let content = content.replace("\r\n", "\n");
        let rest = content
            .strip_prefix("+++\n")
            .ok_or_else(|| malformed("missing opening +++ fence".into()))?;
        let (header_src, body) = match rest.split_once("\n+++\n") {
            Some(split) => split,
            None => rest
                .strip_suffix("\n+++")
                .map(|h| (h, ""))
                .ok_or_else(|| malformed("missing closing +++ fence".into()))?,
        };

        let header: Header =
            toml::from_str(header_src).map_err(|e| malformed(format!("header: {}", e)))?;
        if header.id != id {
            return Err(malformed(format!("header id is {}", header.id)));
        }

        let body = parse_body(body).map_err(malformed)?;

        Ok(Self {
            id: header.id,
            ticket_type: header.ticket_type,
            priority: header.priority,
            state: header.state,
            assigned_agent_id: header.assigned_agent_id,
            assigned_at: header.assigned_at,
            depends_on: header.depends_on,
            blocks: header.blocks,
            created_at: header.created_at,
            created_by: header.created_by,
            updated_at: header.updated_at,
            title: body.title,
            description: body.description,
            acceptance_criteria: body.criteria,
            comments: body.comments,
        })
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [P{}] [{}] {} - {}",
            self.id, self.priority, self.ticket_type, self.state, self.title
        )
    }
}

#[derive(Default)]
struct Body {
    title: String,
    description: String,
    criteria: Vec<Criterion>,
    comments: Vec<Comment>,
}

#[derive(PartialEq)]
enum Section {
    Preamble,
    Description,
    Criteria,
    Comments,
}

fn parse_body(body: &str) -> std::result::Result<Body, String> {
    let mut out = Body::default();
    let mut title = None;
    let mut section = Section::Preamble;
    let mut description = Vec::new();
    let mut comment: Option<(Comment, Vec<String>)> = None;

    for line in body.lines() {
        if let Some(heading) = line.strip_prefix("# ") {
            if title.is_some() {
                return Err(format!("second title line: {}", line));
            }
            title = Some(heading.trim().to_string());
            continue;
        }
        if line.starts_with("## ") {
            section = match line.trim_end() {
                DESCRIPTION_HEADING => Section::Description,
                CRITERIA_HEADING => Section::Criteria,
                COMMENTS_HEADING => Section::Comments,
                other => return Err(format!("unknown section: {}", other)),
            };
            continue;
        }
        if let Some(entry) = line.strip_prefix("### ") {
            if section != Section::Comments {
                return Err(format!("comment heading outside comments: {}", line));
            }
            if let Some(done) = comment.take() {
                out.comments.push(finish_comment(done));
            }
            comment = Some((parse_comment_heading(entry)?, Vec::new()));
            continue;
        }
        if line.starts_with('#') {
            return Err(format!("unexpected heading: {}", line));
        }

        let text = unescape(line);
        match section {
            Section::Preamble => {
                if !line.trim().is_empty() {
                    return Err(format!("text outside any section: {}", line));
                }
            }
            Section::Description => description.push(text.to_string()),
            Section::Criteria => {
                if line.trim().is_empty() {
                    continue;
                }
                out.criteria.push(parse_criterion(line)?);
            }
            Section::Comments => match comment.as_mut() {
                Some((_, lines)) => lines.push(text.to_string()),
                None if line.trim().is_empty() => {}
                None => return Err(format!("comment text without heading: {}", line)),
            },
        }
    }
    if let Some(done) = comment.take() {
        out.comments.push(finish_comment(done));
    }

    out.title = title
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "missing title".to_string())?;
    out.description = description.join("\n").trim().to_string();
    Ok(out)
}

fn parse_comment_heading(entry: &str) -> std::result::Result<Comment, String> {
    let (at, author) = entry
        .split_once(' ')
        .ok_or_else(|| format!("comment heading without author: {}", entry))?;
    let at = DateTime::parse_from_rfc3339(at)
        .map_err(|e| format!("comment timestamp {}: {}", at, e))?
        .with_timezone(&Utc);
    Ok(Comment {
        at,
        author: author.trim().to_string(),
        text: String::new(),
    })
}

fn finish_comment((mut comment, lines): (Comment, Vec<String>)) -> Comment {
    comment.text = lines.join("\n").trim().to_string();
    comment
}

fn parse_criterion(line: &str) -> std::result::Result<Criterion, String> {
    let line = line.trim_end();
    if let Some(text) = line.strip_prefix("- [ ] ") {
        Ok(Criterion::open(text.trim()))
    } else if let Some(text) = line
        .strip_prefix("- [x] ")
        .or_else(|| line.strip_prefix("- [X] "))
    {
        Ok(Criterion {
            text: text.trim().to_string(),
            done: true,
        })
    } else {
        Err(format!("not a checklist item: {}", line))
    }
}

fn escape(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.starts_with(['#', '\\']) {
                format!("\\{}", line)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape(line: &str) -> &str {
    line.strip_prefix('\\').unwrap_or(line)
}
