//! Typed ID definitions for all fleet resources.

use crate::define_id;

// Fleet topology
define_id!(NodeId, "node");
define_id!(InstanceId, "inst");

// Template catalog
define_id!(TemplateId, "tpl");
define_id!(TemplateVersionId, "tplv");

// Audit trail
define_id!(EventId, "evt");

// HTTP plumbing
define_id!(RequestId, "req");
