//! Message shapes that cross the boundary to the worker pool

use crate::point::Point;
use crate::tracer::Tracer;

/// Point name that older producers use to signal the end of a result stream
pub const END_OF_STREAM_NAME: &str = "done";

/// What a package asks the worker pool to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Write,
    Query,
}

/// An opaque unit of work for the worker pool.
/// Ownership moves to the pool on send.
#[derive(Debug)]
pub struct Package {
    pub kind: PackageKind,
    pub body: Vec<u8>,
    pub statement_id: String,
    pub tracer: Tracer,
}

impl Package {
    pub fn new(
        kind: PackageKind,
        body: impl Into<Vec<u8>>,
        statement_id: impl Into<String>,
        tracer: Tracer,
    ) -> Self {
        Self {
            kind,
            body: body.into(),
            statement_id: statement_id.into(),
            tracer,
        }
    }
}

/// Where a test-state property lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyScope {
    /// Held only by the coordinator, applied synchronously
    Local,
    /// Held only by the worker pool
    Downstream,
    /// Held by both; set locally and forwarded
    Both,
}

impl PropertyScope {
    pub fn of(property: &str) -> Self {
        match property {
            "precision" => PropertyScope::Both,
            "startdate" | "batchsize" => PropertyScope::Local,
            _ => PropertyScope::Downstream,
        }
    }

    /// Whether the property needs a round trip through the worker pool
    pub fn is_forwarded(&self) -> bool {
        !matches!(self, PropertyScope::Local)
    }
}

/// A request to change a named test-state variable
#[derive(Debug)]
pub struct Directive {
    pub property: String,
    pub value: String,
    pub tracer: Tracer,
}

impl Directive {
    /// Create a directive; the property name is lower-cased
    pub fn new(property: &str, value: impl Into<String>, tracer: Tracer) -> Self {
        Self {
            property: property.to_lowercase(),
            value: value.into(),
            tracer,
        }
    }

    pub fn scope(&self) -> PropertyScope {
        PropertyScope::of(&self.property)
    }
}

/// A result flowing back from the worker pool
#[derive(Debug)]
pub enum Response {
    DataPoint { point: Point, tracer: Tracer },
    EndOfStream { tracer: Tracer },
}

impl Response {
    pub fn data(point: Point, tracer: Tracer) -> Self {
        Response::DataPoint { point, tracer }
    }

    pub fn end_of_stream(tracer: Tracer) -> Self {
        Response::EndOfStream { tracer }
    }

    /// Classify a point that may carry the legacy `done` sentinel name
    pub fn from_point(point: Point, tracer: Tracer) -> Self {
        if point.name() == END_OF_STREAM_NAME {
            Response::EndOfStream { tracer }
        } else {
            Response::DataPoint { point, tracer }
        }
    }

    pub fn tracer(&self) -> &Tracer {
        match self {
            Response::DataPoint { tracer, .. } | Response::EndOfStream { tracer } => tracer,
        }
    }
}
