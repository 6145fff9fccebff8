//! Parsed form of queries and keys.
//!
//! A [Query] is a list of segments. A [ResourceQuerySegment] addresses data in a store
//! through a [Key], a [TransformQuerySegment] is a chain of [ActionRequest]s optionally
//! terminated by a filename. Every node can be turned back into its canonical text with `encode`.
//! Source positions are carried along for error reporting but never take part in comparisons.
use itertools::Itertools;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::ops::{Add, Index};

/// Location in the query text; line 0 means the location is not known.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub offset: usize,
    pub line: u32,
    pub column: usize,
}

impl Position {
    pub fn new(offset: usize, line: u32, column: usize) -> Self {
        Position {
            offset,
            line,
            column,
        }
    }

    pub fn unknown() -> Position {
        Position::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.line == 0
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            0 => f.write_str("(unknown position)"),
            1 => write!(f, "position {}", self.column),
            line => write!(f, "line {}, position {}", line, self.column),
        }
    }
}

/// Equality and hashing over the listed fields only, so that positions are ignored.
macro_rules! same_when_fields_equal {
    ($type:ty => $($field:ident),+) => {
        impl PartialEq for $type {
            fn eq(&self, other: &Self) -> bool {
                $(self.$field == other.$field)&&+
            }
        }

        impl Eq for $type {}

        impl Hash for $type {
            fn hash<H: Hasher>(&self, state: &mut H) {
                $(self.$field.hash(state);)+
            }
        }
    };
}

/// Display as the canonical encoding.
macro_rules! display_encoded {
    ($($type:ty),+) => {
        $(
            impl Display for $type {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.encode())
                }
            }
        )+
    };
}

/// Entity substitutions of [encode_token], applied in this order.
/// The parser reverses them.
const TOKEN_ENTITIES: [(&str, &str); 8] = [
    ("~", "~~"),
    ("https://", "~H"),
    ("http://", "~h"),
    ("file://", "~f"),
    ("://", "~P"),
    ("/", "~I"),
    ("-", "~_"),
    (" ", "~."),
];

fn push_percent_encoded(out: &mut String, c: char) {
    let mut utf8 = [0u8; 4];
    for byte in c.encode_utf8(&mut utf8).bytes() {
        out.push_str(&format!("%{:02X}", byte));
    }
}

/// Encode text so that it can stand as an action parameter.
///
/// Entities are substituted first (`-` becomes `~_`, `/` becomes `~I`, ...), then every
/// character outside `[A-Za-z0-9_.~+]` is percent-encoded with upper-case hex digits.
pub fn encode_token<S: AsRef<str>>(text: S) -> String {
    let substituted = TOKEN_ENTITIES
        .iter()
        .fold(text.as_ref().to_owned(), |acc, (from, to)| acc.replace(from, to));
    let mut out = String::with_capacity(substituted.len());
    for c in substituted.chars() {
        if c.is_ascii_alphanumeric() || "_.~+".contains(c) {
            out.push(c);
        } else {
            push_percent_encoded(&mut out, c);
        }
    }
    out
}

/// Encode a single key element.
/// Unlike a token, a resource name keeps `-`, unless it would start the name.
pub fn encode_resource_name<S: AsRef<str>>(name: S) -> String {
    let mut out = String::new();
    for (i, c) in name.as_ref().chars().enumerate() {
        match c {
            '-' if i == 0 => out.push_str("~_"),
            '~' => out.push_str("~~"),
            ' ' => out.push_str("~."),
            c if c.is_ascii_alphanumeric() || "-_.".contains(c) => out.push(c),
            c => push_percent_encoded(&mut out, c),
        }
    }
    out
}

/// Parameter of an action: plain text or a link to another query (`~X~...~E`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ActionParameter {
    String(String, Position),
    Link(Query, Position),
}

impl ActionParameter {
    pub fn new_string(parameter: String) -> ActionParameter {
        ActionParameter::String(parameter, Position::unknown())
    }

    pub fn new_link(query: Query) -> ActionParameter {
        ActionParameter::Link(query, Position::unknown())
    }

    pub fn is_string(&self) -> bool {
        matches!(self, ActionParameter::String(..))
    }

    pub fn is_link(&self) -> bool {
        matches!(self, ActionParameter::Link(..))
    }

    pub fn string_value(&self) -> Option<String> {
        match self {
            ActionParameter::String(text, _) => Some(text.clone()),
            ActionParameter::Link(..) => None,
        }
    }

    pub fn link_value(&self) -> Option<Query> {
        match self {
            ActionParameter::Link(query, _) => Some(query.clone()),
            ActionParameter::String(..) => None,
        }
    }

    pub fn position(&self) -> Position {
        match self {
            ActionParameter::String(_, position) | ActionParameter::Link(_, position) => {
                position.clone()
            }
        }
    }

    pub fn with_position(self, position: Position) -> Self {
        match self {
            ActionParameter::String(text, _) => ActionParameter::String(text, position),
            ActionParameter::Link(query, _) => ActionParameter::Link(query, position),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ActionParameter::String(text, _) => encode_token(text),
            ActionParameter::Link(query, _) => format!("~X~{}~E", query.encode()),
        }
    }
}

impl PartialEq for ActionParameter {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ActionParameter::String(a, _), ActionParameter::String(b, _)) => a == b,
            (ActionParameter::Link(a, _), ActionParameter::Link(b, _)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ActionParameter {}

impl Hash for ActionParameter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ActionParameter::String(text, _) => text.hash(state),
            ActionParameter::Link(query, _) => query.hash(state),
        }
    }
}

/// One element of a [Key].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResourceName {
    pub name: String,
    pub position: Position,
}

impl ResourceName {
    pub fn new(name: String) -> Self {
        ResourceName {
            name,
            position: Position::unknown(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    /// `.` refers to the directory the query is relative to
    pub fn is_cwd(&self) -> bool {
        self.name == "."
    }

    pub fn is_parent(&self) -> bool {
        self.name == ".."
    }

    /// Text after the last dot
    pub fn extension(&self) -> Option<String> {
        self.name.rsplit_once('.').map(|(_, ext)| ext.to_owned())
    }

    pub fn encode(&self) -> String {
        encode_resource_name(&self.name)
    }
}

same_when_fields_equal!(ResourceName => name);

/// A command invocation: name followed by `-` separated parameters.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ActionRequest {
    pub name: String,
    pub parameters: Vec<ActionParameter>,
    pub position: Position,
}

impl ActionRequest {
    pub fn new(name: String) -> ActionRequest {
        ActionRequest {
            name,
            ..Default::default()
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<ActionParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// `ns-a-b` selects the namespaces used to look up the following actions
    pub fn is_ns(&self) -> bool {
        self.name == "ns"
    }

    pub fn ns(&self) -> Option<Vec<ActionParameter>> {
        self.is_ns().then(|| self.parameters.clone())
    }

    pub fn encode(&self) -> String {
        std::iter::once(self.name.clone())
            .chain(self.parameters.iter().map(ActionParameter::encode))
            .join("-")
    }
}

same_when_fields_equal!(ActionRequest => name, parameters);

/// Parameter of a segment header.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HeaderParameter {
    pub value: String,
    pub position: Position,
}

impl HeaderParameter {
    pub fn new(value: String) -> HeaderParameter {
        HeaderParameter {
            value,
            position: Position::unknown(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn encode(&self) -> String {
        encode_token(&self.value)
    }
}

same_when_fields_equal!(HeaderParameter => value);

impl Display for HeaderParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Header opening a segment, e.g. `-R`, `-Rmeta-x` or `--name-p1`.
/// `level` counts the leading dashes and is at least 1.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SegmentHeader {
    pub name: String,
    pub level: usize,
    pub parameters: Vec<HeaderParameter>,
    pub resource: bool,
    pub position: Position,
}

impl SegmentHeader {
    pub fn new() -> SegmentHeader {
        SegmentHeader {
            name: String::new(),
            level: 1,
            parameters: Vec::new(),
            resource: false,
            position: Position::unknown(),
        }
    }

    pub fn new_resource() -> SegmentHeader {
        SegmentHeader {
            resource: true,
            ..SegmentHeader::new()
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    /// A single dash without name or parameters carries no information
    pub fn is_trivial(&self) -> bool {
        self.name.is_empty() && self.level <= 1 && self.parameters.is_empty()
    }

    /// Parameters can only follow a name, a header without a name encodes as its dashes alone
    pub fn encode(&self) -> String {
        let mut head = "-".repeat(self.level.max(1));
        if self.resource {
            head.push('R');
        }
        if self.name.is_empty() {
            return head;
        }
        head.push_str(&self.name);
        std::iter::once(head)
            .chain(self.parameters.iter().map(HeaderParameter::encode))
            .join("-")
    }
}

impl Default for SegmentHeader {
    fn default() -> Self {
        SegmentHeader::new()
    }
}

same_when_fields_equal!(SegmentHeader => name, level, parameters, resource);

/// Transformation segment: actions applied in order, optionally ending with a filename.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TransformQuerySegment {
    pub header: Option<SegmentHeader>,
    pub query: Vec<ActionRequest>,
    pub filename: Option<ResourceName>,
}

impl TransformQuerySegment {
    pub fn new() -> TransformQuerySegment {
        TransformQuerySegment::default()
    }

    fn with_parts(&self, query: Vec<ActionRequest>, filename: Option<ResourceName>) -> Self {
        TransformQuerySegment {
            header: self.header.clone(),
            query,
            filename,
        }
    }

    pub fn name(&self) -> String {
        self.header
            .as_ref()
            .map(|h| h.name.clone())
            .unwrap_or_default()
    }

    /// Split off the last step: the filename if there is one, otherwise the last action.
    /// Both halves keep the header.
    pub fn predecessor(&self) -> (Option<TransformQuerySegment>, Option<TransformQuerySegment>) {
        if let Some(filename) = &self.filename {
            return (
                Some(self.with_parts(self.query.clone(), None)),
                Some(self.with_parts(Vec::new(), Some(filename.clone()))),
            );
        }
        match self.query.split_last() {
            Some((last, rest)) => (
                Some(self.with_parts(rest.to_vec(), None)),
                Some(self.with_parts(vec![last.clone()], None)),
            ),
            None => (None, None),
        }
    }

    pub fn len(&self) -> usize {
        self.query.len()
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty() && self.filename.is_none()
    }

    pub fn is_filename(&self) -> bool {
        self.query.is_empty() && self.filename.is_some()
    }

    pub fn is_action_request(&self) -> bool {
        self.query.len() == 1 && self.filename.is_none()
    }

    pub fn action(&self) -> Option<ActionRequest> {
        match (self.query.as_slice(), &self.filename) {
            ([action], None) => Some(action.clone()),
            _ => None,
        }
    }

    pub fn is_ns(&self) -> bool {
        self.ns().is_some()
    }

    pub fn ns(&self) -> Option<Vec<ActionParameter>> {
        self.action()?.ns()
    }

    pub fn last_ns(&self) -> Option<Vec<ActionParameter>> {
        self.query.iter().rev().find_map(ActionRequest::ns)
    }

    pub fn encode(&self) -> String {
        self.header
            .iter()
            .map(SegmentHeader::encode)
            .chain(self.query.iter().map(ActionRequest::encode))
            .chain(self.filename.iter().map(ResourceName::encode))
            .join("/")
    }
}

/// Concatenate actions; the header comes from the left side, the filename from the right.
impl Add for TransformQuerySegment {
    type Output = TransformQuerySegment;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.query.extend(rhs.query);
        self.filename = rhs.filename;
        self
    }
}

impl Add<Option<TransformQuerySegment>> for TransformQuerySegment {
    type Output = TransformQuerySegment;

    fn add(self, rhs: Option<TransformQuerySegment>) -> Self::Output {
        match rhs {
            Some(rhs) => self + rhs,
            None => self,
        }
    }
}

/// Path of a resource in a store, e.g. `dir/sub/file.txt`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Key(pub Vec<ResourceName>);

impl Key {
    pub fn new() -> Self {
        Key(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceName> {
        self.0.iter()
    }

    /// Last element, i.e. the file name in a store
    pub fn filename(&self) -> Option<&ResourceName> {
        self.0.last()
    }

    pub fn extension(&self) -> Option<String> {
        self.filename()?.extension()
    }

    /// True when the leading elements equal `prefix`; every key starts with the empty key.
    pub fn has_key_prefix(&self, prefix: &Key) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn join<S: AsRef<str>>(&self, name: S) -> Self {
        let mut names = self.0.clone();
        names.push(ResourceName::new(name.as_ref().to_owned()));
        Key(names)
    }

    /// Key without its last element; the parent of the empty key is empty.
    pub fn parent(&self) -> Self {
        Key(self
            .0
            .split_last()
            .map(|(_, rest)| rest.to_vec())
            .unwrap_or_default())
    }

    /// Resolve `.` and `..` elements.
    ///
    /// Leading `.` and `..` are relative to `cwd_key`, which is expected to be absolute already.
    /// Once a name has been emitted, `.` is skipped and `..` drops the previous element.
    /// Going above the root stays at the root.
    pub fn to_absolute(&self, cwd_key: &Key) -> Self {
        let mut names: Vec<ResourceName> = Vec::new();
        let mut leading = true;
        for element in self.iter() {
            leading = leading && names.is_empty();
            if element.is_cwd() {
                if leading {
                    names.extend(cwd_key.iter().cloned());
                }
            } else if element.is_parent() {
                if leading {
                    names.extend(cwd_key.parent().0);
                } else {
                    names.pop();
                }
            } else {
                names.push(element.clone());
            }
        }
        Key(names)
    }

    pub fn encode(&self) -> String {
        self.iter().map(ResourceName::encode).join("/")
    }
}

impl Index<usize> for Key {
    type Output = ResourceName;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

/// Resource segment: an optional `-R` header followed by a key.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResourceQuerySegment {
    pub header: Option<SegmentHeader>,
    pub key: Key,
}

impl ResourceQuerySegment {
    pub fn new() -> ResourceQuerySegment {
        ResourceQuerySegment::default()
    }

    pub fn name(&self) -> String {
        self.header
            .as_ref()
            .map(|h| h.name.clone())
            .unwrap_or_default()
    }

    /// Position of the header, or of the first key element when there is no header
    pub fn position(&self) -> Position {
        match (&self.header, self.key.0.first()) {
            (Some(header), _) => header.position.clone(),
            (None, Some(first)) => first.position.clone(),
            (None, None) => Position::unknown(),
        }
    }

    pub fn filename(&self) -> Option<ResourceName> {
        self.key.filename().cloned()
    }

    pub fn is_filename(&self) -> bool {
        self.key.len() == 1
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Key resolved against `cwd_key`, see [Key::to_absolute]
    pub fn to_absolute(&self, cwd_key: &Key) -> Self {
        ResourceQuerySegment {
            header: self.header.clone(),
            key: self.key.to_absolute(cwd_key),
        }
    }

    fn join_with_key(&self, head: Option<String>) -> String {
        head.into_iter()
            .chain(self.key.iter().map(ResourceName::encode))
            .join("/")
    }

    pub fn encode(&self) -> String {
        self.join_with_key(self.header.as_ref().map(SegmentHeader::encode))
    }

    /// Encoding that always starts with a header, `-R` when none was given
    pub fn encode_with_header(&self) -> String {
        let head = self
            .header
            .as_ref()
            .map(SegmentHeader::encode)
            .unwrap_or_else(|| "-R".to_owned());
        self.join_with_key(Some(head))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum QuerySegment {
    Resource(ResourceQuerySegment),
    Transform(TransformQuerySegment),
}

impl QuerySegment {
    pub fn empty_transform_query_segment() -> Self {
        QuerySegment::Transform(TransformQuerySegment::new())
    }

    pub fn as_resource(&self) -> Option<&ResourceQuerySegment> {
        match self {
            QuerySegment::Resource(rqs) => Some(rqs),
            QuerySegment::Transform(_) => None,
        }
    }

    pub fn as_transform(&self) -> Option<&TransformQuerySegment> {
        match self {
            QuerySegment::Transform(tqs) => Some(tqs),
            QuerySegment::Resource(_) => None,
        }
    }

    pub fn is_resource_query_segment(&self) -> bool {
        self.as_resource().is_some()
    }

    pub fn is_transform_query_segment(&self) -> bool {
        self.as_transform().is_some()
    }

    pub fn resource_query_segment(&self) -> Option<ResourceQuerySegment> {
        self.as_resource().cloned()
    }

    pub fn transform_query_segment(&self) -> Option<TransformQuerySegment> {
        self.as_transform().cloned()
    }

    pub fn name(&self) -> String {
        match self {
            QuerySegment::Resource(rqs) => rqs.name(),
            QuerySegment::Transform(tqs) => tqs.name(),
        }
    }

    pub fn filename(&self) -> Option<ResourceName> {
        match self {
            QuerySegment::Resource(rqs) => rqs.filename(),
            QuerySegment::Transform(tqs) => tqs.filename.clone(),
        }
    }

    /// Number of actions or key elements
    pub fn len(&self) -> usize {
        match self {
            QuerySegment::Resource(rqs) => rqs.len(),
            QuerySegment::Transform(tqs) => tqs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            QuerySegment::Resource(rqs) => rqs.is_empty(),
            QuerySegment::Transform(tqs) => tqs.is_empty(),
        }
    }

    pub fn is_filename(&self) -> bool {
        match self {
            QuerySegment::Resource(rqs) => rqs.is_filename(),
            QuerySegment::Transform(tqs) => tqs.is_filename(),
        }
    }

    pub fn is_action_request(&self) -> bool {
        self.as_transform()
            .map_or(false, TransformQuerySegment::is_action_request)
    }

    pub fn action(&self) -> Option<ActionRequest> {
        self.as_transform()?.action()
    }

    pub fn is_ns(&self) -> bool {
        self.as_transform().map_or(false, TransformQuerySegment::is_ns)
    }

    pub fn ns(&self) -> Option<Vec<ActionParameter>> {
        self.as_transform()?.ns()
    }

    pub fn last_ns(&self) -> Option<Vec<ActionParameter>> {
        self.as_transform()?.last_ns()
    }

    /// Only resource segments are affected, see [Key::to_absolute]
    pub fn to_absolute(&self, cwd_key: &Key) -> Self {
        match self {
            QuerySegment::Resource(rqs) => QuerySegment::Resource(rqs.to_absolute(cwd_key)),
            QuerySegment::Transform(_) => self.clone(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            QuerySegment::Resource(rqs) => rqs.encode(),
            QuerySegment::Transform(tqs) => tqs.encode(),
        }
    }

    pub fn encode_with_header(&self) -> String {
        match self {
            QuerySegment::Resource(rqs) => rqs.encode_with_header(),
            QuerySegment::Transform(tqs) => tqs.encode(),
        }
    }
}

impl Default for QuerySegment {
    fn default() -> Self {
        QuerySegment::Resource(ResourceQuerySegment::default())
    }
}

/// A pipeline: usually a resource followed by transformations.
/// An absolute query (leading `/`) is never resolved against a parent query.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Query {
    pub segments: Vec<QuerySegment>,
    pub absolute: bool,
}

same_when_fields_equal!(Query => segments, absolute);

display_encoded!(
    ActionParameter,
    ResourceName,
    ActionRequest,
    SegmentHeader,
    TransformQuerySegment,
    Key,
    ResourceQuerySegment,
    QuerySegment,
    Query
);

impl Query {
    pub fn new() -> Query {
        Query::default()
    }

    fn with_segments(&self, segments: Vec<QuerySegment>) -> Query {
        Query {
            segments,
            absolute: self.absolute,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn filename(&self) -> Option<ResourceName> {
        self.segments.last()?.filename()
    }

    pub fn extension(&self) -> Option<String> {
        self.filename()?.extension()
    }

    /// The only segment, when it is a transformation
    pub fn transform_query(&self) -> Option<TransformQuerySegment> {
        match self.segments.as_slice() {
            [QuerySegment::Transform(tqs)] => Some(tqs.clone()),
            _ => None,
        }
    }

    /// The only segment, when it is a resource
    pub fn resource_query(&self) -> Option<ResourceQuerySegment> {
        match self.segments.as_slice() {
            [QuerySegment::Resource(rqs)] => Some(rqs.clone()),
            _ => None,
        }
    }

    pub fn is_transform_query(&self) -> bool {
        self.transform_query().is_some()
    }

    pub fn is_resource_query(&self) -> bool {
        self.resource_query().is_some()
    }

    pub fn is_action_request(&self) -> bool {
        self.action().is_some()
    }

    pub fn action(&self) -> Option<ActionRequest> {
        self.transform_query()?.action()
    }

    pub fn is_ns(&self) -> bool {
        self.ns().is_some()
    }

    pub fn ns(&self) -> Option<Vec<ActionParameter>> {
        self.transform_query()?.ns()
    }

    pub fn last_ns(&self) -> Option<Vec<ActionParameter>> {
        self.transform_query()?.last_ns()
    }

    /// All actions of all transform segments, in evaluation order
    pub fn action_requests(&self) -> Vec<&ActionRequest> {
        self.segments
            .iter()
            .filter_map(QuerySegment::as_transform)
            .flat_map(|tqs| tqs.query.iter())
            .collect()
    }

    /// Resolve `.` and `..` in resource segments, see [Key::to_absolute]
    pub fn to_absolute(&self, cwd_key: &Key) -> Self {
        self.with_segments(
            self.segments
                .iter()
                .map(|segment| segment.to_absolute(cwd_key))
                .collect(),
        )
    }

    /// Split the query into (predecessor, remainder).
    ///
    /// The remainder is the last step: the filename or the last action of a trailing transform
    /// segment, or a whole trailing resource segment. A resource segment is never split, so a
    /// pure resource query has neither predecessor nor remainder.
    pub fn predecessor(&self) -> (Option<Query>, Option<QuerySegment>) {
        let (last, init) = match self.segments.split_last() {
            Some(split) => split,
            None => return (None, None),
        };
        match last {
            QuerySegment::Resource(_) if init.is_empty() => (None, None),
            QuerySegment::Resource(_) => (Some(self.with_segments(init.to_vec())), Some(last.clone())),
            QuerySegment::Transform(tqs) => {
                let (head, tail) = tqs.predecessor();
                let mut segments = init.to_vec();
                segments.extend(
                    head.filter(|h| !h.is_empty())
                        .map(QuerySegment::Transform),
                );
                (
                    Some(self.with_segments(segments)),
                    tail.map(QuerySegment::Transform),
                )
            }
        }
    }

    /// Walk the predecessor chain from the query itself towards its start.
    ///
    /// Each item pairs a prefix with everything that has to be applied to it to arrive at
    /// the full query; the first item is the query itself with nothing left to apply.
    pub fn all_predecessors(&self) -> Vec<(Option<Query>, Option<QuerySegment>)> {
        let mut chain = Vec::new();
        let mut current = Some(self.clone());
        let mut tail: Option<QuerySegment> = None;
        while let Some(query) = current.take().filter(|q| !q.is_empty()) {
            let (head, last) = query.predecessor();
            chain.push((Some(query), tail.clone()));
            tail = match (last, tail) {
                (Some(QuerySegment::Transform(step)), Some(QuerySegment::Transform(rest))) => {
                    Some(QuerySegment::Transform(step + rest))
                }
                (Some(_), Some(_)) => None,
                (last, None) => last,
                (None, rest) => rest,
            };
            current = head;
        }
        chain
    }

    /// Every single-step split of the query as (predecessor, remainder) pairs.
    /// A missing part is replaced by an empty one and pairs that are empty on both sides are skipped.
    /// A query starting with a pure resource ends the list with `(empty, resource)`.
    pub fn all_predecessor_tuples(&self) -> Vec<(Query, QuerySegment)> {
        fn push_split(
            splits: &mut Vec<(Query, QuerySegment)>,
            head: Option<Query>,
            tail: Option<QuerySegment>,
        ) {
            let split = match (head, tail) {
                (Some(head), Some(tail)) if !head.is_empty() || !tail.is_empty() => (head, tail),
                (Some(head), None) if !head.is_empty() => {
                    (head, QuerySegment::empty_transform_query_segment())
                }
                (None, Some(tail)) if !tail.is_empty() => (Query::new(), tail),
                _ => return,
            };
            splits.push(split);
        }

        let mut splits = Vec::new();
        let mut current = Some(self.clone());
        let mut first_step = None;
        while let Some(query) = current {
            first_step = Some(query.clone()).filter(|q| !q.is_empty());
            let (head, tail) = query.predecessor();
            push_split(&mut splits, head.clone(), tail);
            current = head;
        }
        if let Some(first) = first_step {
            push_split(
                &mut splits,
                None,
                first.resource_query().map(QuerySegment::Resource),
            );
        }
        splits
    }

    /// The query with its trailing filename removed
    pub fn without_filename(self) -> Query {
        if self.filename().is_none() {
            return self;
        }
        match self.predecessor() {
            (Some(head), _) => head,
            (None, _) => self.with_segments(Vec::new()),
        }
    }

    /// Extend this query by a relative query, as when a command applies a query to its input.
    ///
    /// A leading header-less transform segment of `other` continues the last transform segment
    /// of this query (or opens a new `-` segment after a resource). The filename of this query
    /// is dropped since a filename can only end a query.
    pub fn append(&self, other: &Query) -> Query {
        let mut segments = self.segments.clone();
        if other.is_empty() {
            return self.with_segments(segments);
        }
        if let Some(QuerySegment::Transform(last)) = segments.last_mut() {
            last.filename = None;
        }
        if matches!(segments.last(), Some(QuerySegment::Transform(t)) if t.is_empty() && t.header.is_none())
        {
            segments.pop();
        }

        let mut rest = other.segments.as_slice();
        if let Some((QuerySegment::Transform(first), tail)) = other.segments.split_first() {
            if first.header.is_none() {
                if let Some(QuerySegment::Transform(last)) = segments.last_mut() {
                    *last = last.clone() + first.clone();
                    rest = tail;
                } else if !segments.is_empty() {
                    let mut opened = first.clone();
                    opened.header = Some(SegmentHeader::new());
                    segments.push(QuerySegment::Transform(opened));
                    rest = tail;
                }
            }
        }
        segments.extend(rest.iter().cloned());
        self.with_segments(segments)
    }

    /// Short description for log lines: the last step, or the tail of at most `n` characters
    pub fn short(&self, n: usize) -> String {
        if let (_, Some(step)) = self.predecessor() {
            return step.encode();
        }
        let text = self.encode();
        let count = text.chars().count();
        if count > n {
            format!("...{}", text.chars().skip(count - n).collect::<String>())
        } else {
            text
        }
    }

    pub fn encode(&self) -> String {
        let body = self
            .segments
            .iter()
            .map(QuerySegment::encode_with_header)
            .join("/");
        if self.absolute {
            format!("/{}", body)
        } else {
            body
        }
    }
}

impl Index<usize> for Query {
    type Output = QuerySegment;

    fn index(&self, index: usize) -> &Self::Output {
        &self.segments[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::parse::{parse_key, parse_query};

    fn hello_link() -> Query {
        Query {
            segments: vec![QuerySegment::Transform(TransformQuerySegment {
                query: vec![ActionRequest::new("hello".to_owned())],
                ..Default::default()
            })],
            absolute: false,
        }
    }

    #[test]
    fn key_prefixes() -> Result<(), Error> {
        let key = parse_key("a/b/c")?;
        assert!(key.has_key_prefix(&Key::new()));
        assert!(key.has_key_prefix(&parse_key("a/b")?));
        assert!(key.has_key_prefix(&key));
        assert!(!key.has_key_prefix(&parse_key("a/c")?));
        assert!(!parse_key("a")?.has_key_prefix(&key));
        Ok(())
    }

    #[test]
    fn links_and_actions_encode() {
        assert_eq!(ActionParameter::new_link(hello_link()).encode(), "~X~hello~E");
        assert_eq!(ActionRequest::new("plain".to_owned()).encode(), "plain");
        let action = ActionRequest::new("show".to_owned()).with_parameters(vec![
            ActionParameter::new_link(hello_link()),
            ActionParameter::new_string("big world".to_owned()),
        ]);
        assert_eq!(action.to_string(), "show-~X~hello~E-big~.world");
    }

    #[test]
    fn positions_do_not_affect_equality() {
        let a = ActionRequest::new("f".to_owned())
            .with_parameters(vec![ActionParameter::new_string("1".to_owned())]);
        let b = a.clone().with_position(Position::new(4, 1, 5)).with_parameters(vec![
            ActionParameter::new_string("1".to_owned()).with_position(Position::new(6, 1, 7)),
        ]);
        assert_eq!(a, b);
        let mut seen = std::collections::HashSet::new();
        seen.insert(a);
        assert!(seen.contains(&b));
    }

    #[test]
    fn filename_is_taken_from_the_right_side() {
        let actions = TransformQuerySegment {
            query: vec![ActionRequest::new("act".to_owned())],
            ..Default::default()
        };
        let file = TransformQuerySegment {
            filename: Some(ResourceName::new("out.txt".to_owned())),
            ..Default::default()
        };
        assert_eq!((actions.clone() + file).encode(), "act/out.txt");
        assert_eq!((actions + None).encode(), "act");
    }

    #[test]
    fn relative_elements_resolve() -> Result<(), Error> {
        let cwd = parse_key("a/b/c")?;
        let cases = [
            ("./x", "a/b/c/x"),
            ("../x", "a/b/x"),
            ("../../x", "a/x"),
            ("../../../x", "x"),
            ("../../../../x", "x"),
            ("A/B/./x", "A/B/x"),
            ("A/B/../x", "A/x"),
        ];
        for (relative, expected) in cases {
            assert_eq!(parse_key(relative)?.to_absolute(&cwd).encode(), expected, "{}", relative);
        }
        Ok(())
    }

    #[test]
    fn parents_stop_at_root() -> Result<(), Error> {
        let key = parse_key("a/b")?;
        assert_eq!(key.parent().encode(), "a");
        assert!(key.parent().parent().is_empty());
        assert!(Key::new().parent().is_empty());
        Ok(())
    }

    #[test]
    fn extensions() -> Result<(), Error> {
        assert_eq!(Key::new().extension(), None);
        assert_eq!(parse_key("dir/noext")?.extension(), None);
        assert_eq!(parse_key("dir/report.txt")?.extension(), Some("txt".to_owned()));
        assert_eq!(parse_key(".hidden")?.extension(), Some("hidden".to_owned()));
        assert_eq!(parse_key("arch.tar.gz")?.extension(), Some("gz".to_owned()));
        Ok(())
    }

    #[test]
    fn token_entities_and_percent_escapes() {
        let cases = [
            ("abc", "abc"),
            ("a-b", "a~_b"),
            ("a/b", "a~Ib"),
            ("two words", "two~.words"),
            ("~", "~~"),
            ("https://x.com", "~Hx.com"),
            ("http://x.com", "~hx.com"),
            ("file://x", "~fx"),
            ("s3://x", "s3~Px"),
            ("a:b", "a%3Ab"),
            ("é", "%C3%A9"),
        ];
        for (text, encoded) in cases {
            assert_eq!(encode_token(text), encoded);
        }
        assert_eq!(encode_resource_name("a-b.txt"), "a-b.txt");
        assert_eq!(encode_resource_name("-x"), "~_x");
        assert_eq!(encode_resource_name("a b"), "a~.b");
    }

    #[test]
    fn append_continues_the_pipeline() -> Result<(), Error> {
        let cases = [
            ("value-1", "add-2", "value-1/add-2"),
            ("value-1/out.txt", "add-2", "value-1/add-2"),
            ("-R/a/b", "world", "-R/a/b/-/world"),
            ("a/b/data.csv", "c/out.txt", "a/b/c/out.txt"),
        ];
        for (parent, relative, expected) in cases {
            let q = parse_query(parent)?.append(&parse_query(relative)?);
            assert_eq!(q.encode(), expected);
        }
        assert_eq!(Query::new().append(&parse_query("x")?).encode(), "x");
        Ok(())
    }

    #[test]
    fn headers_encode_with_level() {
        let mut head = SegmentHeader::new();
        assert_eq!(head.encode(), "-");
        assert!(head.is_trivial());
        head.level = 3;
        head.parameters.push(HeaderParameter::new("a b".to_owned()));
        assert_eq!(head.encode(), "---");
        assert!(!head.is_trivial());
        head.name = "hdr".to_owned();
        assert_eq!(head.encode(), "---hdr-a~.b");
        assert_eq!(SegmentHeader::new_resource().encode(), "-R");
    }

    #[test]
    fn absolute_and_empty_queries() -> Result<(), Error> {
        assert_eq!(Query::new().encode(), "");
        let q = parse_query("/value-1")?;
        assert!(q.absolute);
        assert_eq!(q.encode(), "/value-1");
        assert_eq!(q.without_filename().encode(), "/value-1");
        assert_eq!(parse_query("value-1/x.txt")?.without_filename().encode(), "value-1");
        Ok(())
    }

    #[test]
    fn short_description() -> Result<(), Error> {
        assert_eq!(parse_query("value-1/add-2")?.short(5), "add-2");
        assert_eq!(parse_query("-R/dir/file.txt")?.short(8), "...file.txt");
        Ok(())
    }
}
