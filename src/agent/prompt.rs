//! System prompt rendered from the capability specs.

use std::fmt::Write as _;

use crate::tools::CapabilitySpec;

/// Build the system prompt describing `capabilities` and the reply format.
pub fn system_prompt(capabilities: &[CapabilitySpec]) -> String {
    let mut prompt = String::from(
        "You are a coding agent. Your goal is to complete the user's task. \
         You have the following tools available:\n\n",
    );

    for spec in capabilities {
        let _ = writeln!(prompt, "- Tool: `{}`", spec.name);
        let _ = writeln!(prompt, "  - Description: {}", spec.description);
        let _ = writeln!(prompt, "  - Arguments: `{}`", spec.param_names().join(", "));
        for param in spec.params {
            let _ = writeln!(
                prompt,
                "    - `{}`{}: {}",
                param.name,
                if param.required { "" } else { " (optional)" },
                param.description
            );
        }
    }

    prompt.push_str(
        r#"
You must respond with a JSON object that contains the key "tool_name" and "args".
The "args" must be a dictionary of arguments for the chosen tool.
Call exactly one tool per response.
If you believe the task is complete, use the `finish_task` tool.

Example:
{
    "tool_name": "list_files",
    "args": {
        "path": "."
    }
}
"#,
    );
    prompt
}
