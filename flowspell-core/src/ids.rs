// ABOUTME: Identifier generation for workflow instances and error records

use uuid::Uuid;

/// New workflow instance id of the form `wf_<hex>`.
pub fn new_workflow_id() -> String {
    format!("wf_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// New error record id of the form `err_<hex>`.
pub fn new_error_id() -> String {
    format!("err_{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Task id for a parallel_foreach child: `<workflow_id>.parallel.<index>`.
pub fn task_id_for(workflow_id: &str, index: usize) -> String {
    format!("{workflow_id}.parallel.{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_ids_have_prefix_and_are_unique() {
        let a = new_workflow_id();
        let b = new_workflow_id();
        assert!(a.starts_with("wf_"));
        assert_eq!(a.len(), 3 + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn task_ids_embed_parent_and_index() {
        assert_eq!(task_id_for("wf_abc", 2), "wf_abc.parallel.2");
    }
}
