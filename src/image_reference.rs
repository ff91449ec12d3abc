use std::fmt;

static DEFAULT_REGISTRY: &str = "docker.io";

/// A tagged container image such as `registry.example.com:5000/team/app:v1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub repository: Repository,
    pub tag: String,
}

/// An image name without a tag, split into the registry host and the path within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub registry: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    MissingRepository,
    MissingTag(String),
    DigestNotAllowed(String),
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestNotAllowed(image) => {
                write!(f, "digest references are not allowed: {}", image)
            }
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::MissingTag(image) => write!(f, "tag is missing: {}", image),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.registry == DEFAULT_REGISTRY {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}/{}", self.registry, self.path)
        }
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        // digest references carry no version we could patch back to
        if s.contains('@') {
            return Err(ParseError::DigestNotAllowed(s.to_string()));
        }

        // the tag delimiter is the last colon after the last slash, a colon before it is a port
        let last_slash = s.rfind('/').map(|pos| pos + 1).unwrap_or(0);
        let (name, tag) = match s[last_slash..].rfind(':') {
            Some(pos) => (&s[..last_slash + pos], &s[last_slash + pos + 1..]),
            None => return Err(ParseError::MissingTag(s.to_string())),
        };
        if tag.is_empty() {
            return Err(ParseError::MissingTag(s.to_string()));
        }

        Ok(Self {
            repository: Repository::parse(name)?,
            tag: tag.to_string(),
        })
    }

    /// The version a container currently runs, i.e. the tag of its image.
    pub fn version_of(image: &str) -> Result<String, ParseError> {
        Ok(Self::parse(image)?.tag)
    }
}

impl Repository {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::MissingRepository);
        }
        if s.contains('@') || s.contains(char::is_whitespace) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        // the first component is a registry host only if it looks like one
        let (registry, path) = match s.split_once('/') {
            Some((host, path))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host, path)
            }
            _ => (DEFAULT_REGISTRY, s),
        };
        if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        Ok(Self {
            registry: registry.to_string(),
            path: path.to_string(),
        })
    }

    /// Host serving the registry HTTP API for this repository.
    pub fn api_host(&self) -> &str {
        match self.registry.as_str() {
            "docker.io" => "registry-1.docker.io",
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry_with_port() {
        let image = ImageReference::parse("registry.local:5000/team/app:v1").unwrap();
        assert_eq!(image.repository.registry, "registry.local:5000");
        assert_eq!(image.repository.path, "team/app");
        assert_eq!(image.tag, "v1");
        assert_eq!(image.to_string(), "registry.local:5000/team/app:v1");
    }

    #[test]
    fn test_parse_docker_hub_short_name() {
        let image = ImageReference::parse("nginx:1.27").unwrap();
        assert_eq!(image.repository.registry, "docker.io");
        assert_eq!(image.repository.api_host(), "registry-1.docker.io");
        assert_eq!(image.repository.path, "nginx");
        assert_eq!(image.to_string(), "nginx:1.27");
    }

    #[test]
    fn test_first_component_without_dot_is_a_path() {
        let image = ImageReference::parse("registry/app:v1").unwrap();
        assert_eq!(image.repository.registry, "docker.io");
        assert_eq!(image.repository.path, "registry/app");
        assert_eq!(image.to_string(), "registry/app:v1");
    }

    #[test]
    fn test_version_is_the_last_tag() {
        assert_eq!(
            ImageReference::version_of("quay.io/org/app:1.2.3-rc1").unwrap(),
            "1.2.3-rc1"
        );
    }

    #[test]
    fn test_missing_tag_is_rejected() {
        assert_eq!(
            ImageReference::parse("registry.local:5000/app"),
            Err(ParseError::MissingTag("registry.local:5000/app".into()))
        );
        assert!(matches!(
            ImageReference::parse("app:"),
            Err(ParseError::MissingTag(_))
        ));
    }

    #[test]
    fn test_digest_is_rejected() {
        assert!(matches!(
            ImageReference::parse("quay.io/app@sha256:abcd"),
            Err(ParseError::DigestNotAllowed(_))
        ));
    }

    #[test]
    fn test_repository_rejects_malformed_paths() {
        assert_eq!(Repository::parse(""), Err(ParseError::MissingRepository));
        assert!(Repository::parse("quay.io/").is_err());
        assert!(Repository::parse("quay.io//app").is_err());
    }
}
