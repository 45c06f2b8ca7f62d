//! Server-sent event vocabulary.

use std::fmt;
use std::str::FromStr;

/// Fixed set of event types carried in SSE frames.
///
/// Viewer-bound frames are `data: <TYPE>:<base64(payload)>`; worker-bound
/// relay frames use a raw correlation id in place of the type and are not
/// part of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Append rendered HTML to the view.
    Write,
    /// Evaluate a JavaScript expression in the viewer.
    Call,
    /// Inject a script element.
    Script,
    /// Inject a style element.
    Css,
    /// Request that the viewer load an external asset; acknowledged via
    /// `POST /loaded`.
    Load,
    /// Reset the view.
    Clear,
    /// A worker callback finished handling a relayed response.
    Release,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Write => "WRITE",
            Self::Call => "CALL",
            Self::Script => "SCRIPT",
            Self::Css => "CSS",
            Self::Load => "LOAD",
            Self::Clear => "CLEAR",
            Self::Release => "RELEASE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unknown event type names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type '{0}'")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WRITE" => Ok(Self::Write),
            "CALL" => Ok(Self::Call),
            "SCRIPT" => Ok(Self::Script),
            "CSS" => Ok(Self::Css),
            "LOAD" => Ok(Self::Load),
            "CLEAR" => Ok(Self::Clear),
            "RELEASE" => Ok(Self::Release),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display() {
        for event in [
            EventType::Write,
            EventType::Call,
            EventType::Script,
            EventType::Css,
            EventType::Load,
            EventType::Clear,
            EventType::Release,
        ] {
            assert_eq!(event.to_string().parse::<EventType>(), Ok(event));
        }
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("write".parse::<EventType>().is_err());
        assert!("STORE".parse::<EventType>().is_err());
    }
}
