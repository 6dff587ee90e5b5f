mod deployment_flow;
mod rollback_once;
