use std::fmt;
use std::str::FromStr;

use crate::error::ConnectorError;

pub const DEFAULT_UNIVERSE_DOMAIN: &str = "googleapis.com";

/// Canonical identifier for a managed Cloud SQL instance: `{project, region,
/// instanceName}` plus the API universe domain it is addressed through.
///
/// Two textual forms are accepted on input: `project:region:instance` and
/// `domain:project:region:instance`. Equality and hashing are on the
/// canonical triple plus the effective domain, so `"p:r:i"` and
/// `"googleapis.com:p:r:i"` compare equal.
#[derive(Clone, Debug, Eq)]
pub struct InstanceUri {
	pub project: String,
	pub region: String,
	pub instance: String,
	pub universe_domain: String,
}

impl InstanceUri {
	pub fn new(
		project: impl Into<String>,
		region: impl Into<String>,
		instance: impl Into<String>,
	) -> Self {
		Self {
			project: project.into(),
			region: region.into(),
			instance: instance.into(),
			universe_domain: DEFAULT_UNIVERSE_DOMAIN.to_string(),
		}
	}

	/// The `project:instance` form embedded in a Google-managed CA leaf
	/// certificate's Common Name.
	pub fn google_managed_cn(&self) -> String {
		format!("{}:{}", self.project, self.instance)
	}
}

impl PartialEq for InstanceUri {
	fn eq(&self, other: &Self) -> bool {
		self.project == other.project
			&& self.region == other.region
			&& self.instance == other.instance
			&& self.universe_domain == other.universe_domain
	}
}

impl std::hash::Hash for InstanceUri {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.project.hash(state);
		self.region.hash(state);
		self.instance.hash(state);
		self.universe_domain.hash(state);
	}
}

impl fmt::Display for InstanceUri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.universe_domain == DEFAULT_UNIVERSE_DOMAIN {
			write!(f, "{}:{}:{}", self.project, self.region, self.instance)
		} else {
			write!(
				f,
				"{}:{}:{}:{}",
				self.universe_domain, self.project, self.region, self.instance
			)
		}
	}
}

impl FromStr for InstanceUri {
	type Err = ConnectorError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let parts: Vec<&str> = s.split(':').collect();
		match parts.as_slice() {
			[project, region, instance] => Ok(Self {
				project: require_nonempty("project", project)?,
				region: require_nonempty("region", region)?,
				instance: require_nonempty("instance", instance)?,
				universe_domain: DEFAULT_UNIVERSE_DOMAIN.to_string(),
			}),
			[domain, project, region, instance] => Ok(Self {
				project: require_nonempty("project", project)?,
				region: require_nonempty("region", region)?,
				instance: require_nonempty("instance", instance)?,
				universe_domain: require_nonempty("universe domain", domain)?,
			}),
			_ => Err(ConnectorError::ConfigurationInvalid(format!(
				"instance URI {s:?} must have 3 or 4 colon-separated segments"
			))),
		}
	}
}

fn require_nonempty(field: &str, value: &str) -> Result<String, ConnectorError> {
	if value.is_empty() {
		Err(ConnectorError::ConfigurationInvalid(format!(
			"instance URI {field} segment must not be empty"
		)))
	} else {
		Ok(value.to_string())
	}
}
